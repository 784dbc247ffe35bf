mod memory;
mod sqlite;

pub use memory::*;
pub use sqlite::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AccountId, Amount, Entry, NewEntry};

/// SQL migration for the entries table
pub const MIGRATION_001_ENTRIES: &str = include_str!("migrations/001_entries.sql");

/// Transaction isolation requested from a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// Each read sees the latest committed data. Does not prevent overdraft.
    #[default]
    ReadCommitted,
    /// Committed transactions are equivalent to some serial order; the store
    /// aborts transactions that would break that.
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::Serializable => "serializable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "read-committed" => Some(IsolationLevel::ReadCommitted),
            "serializable" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store operation error.
///
/// `Conflict` and `Unavailable` are transient: re-running the whole
/// transaction may succeed. Anything else is reported as-is.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Transactional, append-only entry storage.
///
/// A `Txn` that is dropped without `commit` must leave no trace: none of its
/// appends become visible to anyone.
#[async_trait]
pub trait Store: Send + Sync {
    type Txn: Send + 'static;

    /// Open a transaction at the given isolation level.
    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Txn, StoreError>;

    /// Signed sum of the account's entries as seen by `txn`, including the
    /// transaction's own uncommitted appends. Zero when there are none.
    async fn sum(&self, account: AccountId, txn: &mut Self::Txn) -> Result<Amount, StoreError>;

    /// Append an entry inside `txn`. The store assigns id and timestamp.
    async fn append(&self, entry: NewEntry, txn: &mut Self::Txn) -> Result<Entry, StoreError>;

    /// Make the transaction durable, or fail with `StoreError::Conflict` if a
    /// concurrently committed transaction invalidated it.
    async fn commit(&self, txn: Self::Txn) -> Result<(), StoreError>;

    async fn rollback(&self, txn: Self::Txn) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!(
            IsolationLevel::from_str("serializable"),
            Some(IsolationLevel::Serializable)
        );
        assert_eq!(
            IsolationLevel::from_str("READ_COMMITTED"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(IsolationLevel::from_str("snapshot"), None);
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }
}
