use thiserror::Error;

use crate::domain::{AccountId, Amount, AmountError, InvalidTransition};
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient funds in account {account}: balance {balance}, required {required}")]
    InsufficientFunds {
        account: AccountId,
        balance: Amount,
        required: Amount,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Conflicting concurrent transaction detected after {attempts} attempt(s): {reason}")]
    ConflictDetected { attempts: u32, reason: String },

    #[error("Store unavailable after {attempts} attempt(s): {reason}")]
    StoreUnavailable { attempts: u32, reason: String },

    #[error("Invalid withdrawal state: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl LedgerError {
    /// Whether re-running the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::ConflictDetected { .. } | LedgerError::StoreUnavailable { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::ConflictDetected { .. })
    }

    /// Record how many attempts were spent before this error surfaced.
    pub fn with_attempts(self, spent: u32) -> Self {
        match self {
            LedgerError::ConflictDetected { reason, .. } => LedgerError::ConflictDetected {
                attempts: spent,
                reason,
            },
            LedgerError::StoreUnavailable { reason, .. } => LedgerError::StoreUnavailable {
                attempts: spent,
                reason,
            },
            other => other,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(reason) => LedgerError::ConflictDetected {
                attempts: 1,
                reason,
            },
            StoreError::Unavailable(reason) => LedgerError::StoreUnavailable {
                attempts: 1,
                reason,
            },
            StoreError::Other(err) => LedgerError::Database(err),
        }
    }
}

impl From<AmountError> for LedgerError {
    fn from(err: AmountError) -> Self {
        LedgerError::InvalidAmount(err.to_string())
    }
}
