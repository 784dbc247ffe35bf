use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::domain::{AccountId, Amount, Entry, NewEntry, compute_balance};

use super::{IsolationLevel, Store, StoreError};

/// In-process multi-version entry store.
///
/// Every commit that appends entries gets a new version. Serializable
/// transactions read the version current at `begin` and, at commit, are
/// refused if any account whose sum they read received entries from a
/// transaction that committed after that version. Transactions that appended
/// nothing always commit. Read-committed
/// transactions read the latest version on every `sum` and are never refused.
///
/// Intended for tests and embedding. Nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    open: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct State {
    /// Committed entries tagged with the version that made them visible
    entries: Vec<(u64, Entry)>,
    version: u64,
}

impl State {
    fn sum_at(&self, account: AccountId, version: u64) -> Option<Amount> {
        self.entries
            .iter()
            .filter(|(committed_at, entry)| *committed_at <= version && entry.account == account)
            .try_fold(0, |balance: Amount, (_, entry)| {
                balance.checked_add(entry.amount)
            })
    }

    fn changed_since(&self, account: AccountId, version: u64) -> bool {
        self.entries
            .iter()
            .any(|(committed_at, entry)| *committed_at > version && entry.account == account)
    }
}

/// Transaction handle for [`MemoryStore`]. Dropping it discards its appends.
#[derive(Debug)]
pub struct MemoryTxn {
    isolation: IsolationLevel,
    snapshot: u64,
    reads: HashSet<AccountId>,
    pending: Vec<Entry>,
    _open: OpenGuard,
}

impl MemoryTxn {
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

#[derive(Debug)]
struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions begun and not yet committed, rolled back or dropped.
    pub fn open_transactions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of committed entries for an account.
    pub fn entry_count(&self, account: AccountId) -> Result<usize, StoreError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|(_, entry)| entry.account == account)
            .count())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Txn = MemoryTxn;

    async fn begin(&self, isolation: IsolationLevel) -> Result<MemoryTxn, StoreError> {
        let snapshot = self.lock()?.version;
        self.open.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryTxn {
            isolation,
            snapshot,
            reads: HashSet::new(),
            pending: Vec::new(),
            _open: OpenGuard(Arc::clone(&self.open)),
        })
    }

    async fn sum(&self, account: AccountId, txn: &mut MemoryTxn) -> Result<Amount, StoreError> {
        let state = self.lock()?;
        let visible = match txn.isolation {
            IsolationLevel::Serializable => txn.snapshot,
            IsolationLevel::ReadCommitted => state.version,
        };
        txn.reads.insert(account);

        state
            .sum_at(account, visible)
            .zip(compute_balance(account, &txn.pending))
            .and_then(|(committed, pending)| committed.checked_add(pending))
            .ok_or_else(|| {
                StoreError::Other(anyhow!("balance of account {} overflows", account))
            })
    }

    async fn append(&self, entry: NewEntry, txn: &mut MemoryTxn) -> Result<Entry, StoreError> {
        let entry = entry.into_entry();
        txn.pending.push(entry.clone());
        Ok(entry)
    }

    async fn commit(&self, txn: MemoryTxn) -> Result<(), StoreError> {
        // Read-only transactions serialize at their snapshot
        if txn.pending.is_empty() {
            return Ok(());
        }

        let mut state = self.lock()?;

        if txn.isolation == IsolationLevel::Serializable {
            if let Some(account) = txn
                .reads
                .iter()
                .copied()
                .find(|&account| state.changed_since(account, txn.snapshot))
            {
                tracing::debug!(
                    account,
                    snapshot = txn.snapshot,
                    version = state.version,
                    "refusing commit: read set changed"
                );
                return Err(StoreError::Conflict(format!(
                    "account {} was modified by a concurrent transaction",
                    account
                )));
            }
        }

        state.version += 1;
        let version = state.version;
        state
            .entries
            .extend(txn.pending.into_iter().map(|entry| (version, entry)));
        Ok(())
    }

    async fn rollback(&self, txn: MemoryTxn) -> Result<(), StoreError> {
        drop(txn);
        Ok(())
    }
}
