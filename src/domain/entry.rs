use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Accounts are owned elsewhere; the ledger only ever sees their identifier.
pub type AccountId = i64;

/// Signed integer amount. Positive values credit an account, negative values debit it.
pub type Amount = i64;

pub type EntryId = Uuid;

/// An immutable ledger fact. Entries are never updated or deleted;
/// corrections are new entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Assigned by the store at append time
    pub id: EntryId,
    pub account: AccountId,
    /// Signed amount (positive = credit, negative = debit)
    pub amount: Amount,
    /// When the store accepted the entry
    pub recorded_at: DateTime<Utc>,
}

impl Entry {
    pub fn is_credit(&self) -> bool {
        self.amount > 0
    }
}

/// An entry that has not been handed to a store yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub account: AccountId,
    pub amount: Amount,
}

impl NewEntry {
    /// Entry adding `amount` to the account.
    pub fn credit(account: AccountId, amount: Amount) -> Self {
        Self { account, amount }
    }

    /// Entry removing `amount` from the account (stored as a negative amount).
    pub fn debit(account: AccountId, amount: Amount) -> Self {
        Self {
            account,
            amount: -amount,
        }
    }

    /// Stamp the entry with a fresh identifier and the current time.
    pub fn into_entry(self) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            account: self.account,
            amount: self.amount,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_is_positive() {
        let entry = NewEntry::credit(7, 500);
        assert_eq!(entry.account, 7);
        assert_eq!(entry.amount, 500);
    }

    #[test]
    fn test_debit_is_negative() {
        let entry = NewEntry::debit(7, 500);
        assert_eq!(entry.amount, -500);
    }

    #[test]
    fn test_into_entry_assigns_unique_ids() {
        let a = NewEntry::credit(1, 10).into_entry();
        let b = NewEntry::credit(1, 10).into_entry();

        assert_ne!(a.id, b.id);
        assert!(a.is_credit());
        assert!(!NewEntry::debit(1, 10).into_entry().is_credit());
    }
}
