use std::fmt;

use super::{AccountId, Amount, Entry};

/// Compute the balance for a single account from a list of entries.
/// Balance = signed sum of the account's entry amounts. No entries means zero.
///
/// Returns `None` when the sum does not fit in an [`Amount`].
pub fn compute_balance(account: AccountId, entries: &[Entry]) -> Option<Amount> {
    entries
        .iter()
        .filter(|entry| entry.account == account)
        .try_fold(0, |balance: Amount, entry| balance.checked_add(entry.amount))
}

/// Validate a caller-supplied withdrawal or deposit amount.
pub fn validate_amount(amount: Amount) -> Result<(), AmountError> {
    if amount <= 0 {
        return Err(AmountError::NotPositive(amount));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    NotPositive(Amount),
}

impl fmt::Display for AmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmountError::NotPositive(amount) => {
                write!(f, "amount must be positive, got {}", amount)
            }
        }
    }
}

impl std::error::Error for AmountError {}
