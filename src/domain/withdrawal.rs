use std::fmt;

use super::{AccountId, Amount, Entry, NewEntry};

/// Lifecycle of a single withdrawal attempt.
///
/// ```text
/// Started -> BalanceRead -> Approved -> Appended -> Committed
///                        \-> Rejected -> Aborted(InsufficientFunds)
/// ```
///
/// `Committed` means the commit was issued. The store can still refuse it,
/// which moves the attempt to `Aborted(ConflictDetected)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalPhase {
    Started,
    BalanceRead,
    Approved,
    Rejected,
    Appended,
    Committed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    InsufficientFunds,
    ConflictDetected,
    StoreFailure,
}

impl WithdrawalPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalPhase::Started => "started",
            WithdrawalPhase::BalanceRead => "balance_read",
            WithdrawalPhase::Approved => "approved",
            WithdrawalPhase::Rejected => "rejected",
            WithdrawalPhase::Appended => "appended",
            WithdrawalPhase::Committed => "committed",
            WithdrawalPhase::Aborted(AbortReason::InsufficientFunds) => "aborted_insufficient_funds",
            WithdrawalPhase::Aborted(AbortReason::ConflictDetected) => "aborted_conflict",
            WithdrawalPhase::Aborted(AbortReason::StoreFailure) => "aborted_store_failure",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: WithdrawalPhase) -> bool {
        use AbortReason::*;
        use WithdrawalPhase::*;

        match (self, next) {
            (Started, BalanceRead) => true,
            (BalanceRead, Approved) | (BalanceRead, Rejected) => true,
            (Rejected, Aborted(InsufficientFunds)) => true,
            (Approved, Appended) => true,
            (Appended, Committed) => true,
            // Store errors can end any in-flight attempt
            (Started | BalanceRead | Approved | Appended, Aborted(ConflictDetected | StoreFailure)) => {
                true
            }
            // The crux: a commit that looked fine locally is refused by the store
            (Committed, Aborted(ConflictDetected | StoreFailure)) => true,
            _ => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, WithdrawalPhase::Aborted(_))
    }
}

impl fmt::Display for WithdrawalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of comparing the observed balance against the requested amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

/// A withdrawal attempt and everything it has observed so far.
#[derive(Debug, Clone)]
pub struct Withdrawal {
    account: AccountId,
    amount: Amount,
    phase: WithdrawalPhase,
    balance_before: Option<Amount>,
    entry: Option<Entry>,
}

impl Withdrawal {
    pub fn start(account: AccountId, amount: Amount) -> Self {
        Self {
            account,
            amount,
            phase: WithdrawalPhase::Started,
            balance_before: None,
            entry: None,
        }
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn phase(&self) -> WithdrawalPhase {
        self.phase
    }

    /// Balance read inside the attempt's transaction.
    pub fn balance_before(&self) -> Option<Amount> {
        self.balance_before
    }

    /// Balance the account will have once the debit is durable.
    pub fn balance_after(&self) -> Option<Amount> {
        self.entry
            .as_ref()
            .and(self.balance_before)
            .map(|balance| balance - self.amount)
    }

    pub fn entry(&self) -> Option<&Entry> {
        self.entry.as_ref()
    }

    /// The debit this withdrawal appends once approved.
    pub fn debit(&self) -> NewEntry {
        NewEntry::debit(self.account, self.amount)
    }

    /// Record the balance read and decide whether the withdrawal may proceed.
    pub fn observe_balance(&mut self, balance: Amount) -> Result<Decision, InvalidTransition> {
        self.advance(WithdrawalPhase::BalanceRead)?;
        self.balance_before = Some(balance);

        if balance < self.amount {
            self.advance(WithdrawalPhase::Rejected)?;
            Ok(Decision::Rejected)
        } else {
            self.advance(WithdrawalPhase::Approved)?;
            Ok(Decision::Approved)
        }
    }

    pub fn record_append(&mut self, entry: Entry) -> Result<(), InvalidTransition> {
        self.advance(WithdrawalPhase::Appended)?;
        self.entry = Some(entry);
        Ok(())
    }

    pub fn record_commit(&mut self) -> Result<(), InvalidTransition> {
        self.advance(WithdrawalPhase::Committed)
    }

    pub fn abort(&mut self, reason: AbortReason) -> Result<(), InvalidTransition> {
        self.advance(WithdrawalPhase::Aborted(reason))
    }

    fn advance(&mut self, next: WithdrawalPhase) -> Result<(), InvalidTransition> {
        if !self.phase.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::trace!(
            account = self.account,
            amount = self.amount,
            from = %self.phase,
            to = %next,
            "withdrawal transition"
        );
        self.phase = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: WithdrawalPhase,
    pub to: WithdrawalPhase,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move withdrawal from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approved_path() {
        let mut withdrawal = Withdrawal::start(1, 300);
        assert_eq!(withdrawal.observe_balance(500), Ok(Decision::Approved));
        assert_eq!(withdrawal.phase(), WithdrawalPhase::Approved);

        let entry = withdrawal.debit().into_entry();
        assert_eq!(entry.amount, -300);
        withdrawal.record_append(entry).unwrap();
        withdrawal.record_commit().unwrap();

        assert_eq!(withdrawal.phase(), WithdrawalPhase::Committed);
        assert_eq!(withdrawal.balance_before(), Some(500));
        assert_eq!(withdrawal.balance_after(), Some(200));
    }

    #[test]
    fn test_exact_balance_is_approved() {
        let mut withdrawal = Withdrawal::start(1, 500);
        assert_eq!(withdrawal.observe_balance(500), Ok(Decision::Approved));
    }

    #[test]
    fn test_rejected_path() {
        let mut withdrawal = Withdrawal::start(1, 1);
        assert_eq!(withdrawal.observe_balance(0), Ok(Decision::Rejected));
        withdrawal.abort(AbortReason::InsufficientFunds).unwrap();

        assert_eq!(
            withdrawal.phase(),
            WithdrawalPhase::Aborted(AbortReason::InsufficientFunds)
        );
        assert!(withdrawal.entry().is_none());
        assert_eq!(withdrawal.balance_after(), None);
    }

    #[test]
    fn test_committed_can_be_refused_by_store() {
        let mut withdrawal = Withdrawal::start(1, 500);
        withdrawal.observe_balance(500).unwrap();
        withdrawal
            .record_append(withdrawal.debit().into_entry())
            .unwrap();
        withdrawal.record_commit().unwrap();

        withdrawal.abort(AbortReason::ConflictDetected).unwrap();
        assert!(withdrawal.phase().is_aborted());
    }

    #[test]
    fn test_cannot_append_before_balance_read() {
        let mut withdrawal = Withdrawal::start(1, 10);
        let entry = withdrawal.debit().into_entry();

        let err = withdrawal.record_append(entry).unwrap_err();
        assert_eq!(err.from, WithdrawalPhase::Started);
        assert_eq!(err.to, WithdrawalPhase::Appended);
        assert_eq!(withdrawal.phase(), WithdrawalPhase::Started);
    }

    #[test]
    fn test_rejected_cannot_append() {
        let mut withdrawal = Withdrawal::start(1, 10);
        withdrawal.observe_balance(5).unwrap();

        assert!(
            withdrawal
                .record_append(withdrawal.debit().into_entry())
                .is_err()
        );
    }

    #[test]
    fn test_insufficient_funds_only_after_rejection() {
        assert!(!WithdrawalPhase::Approved
            .can_transition_to(WithdrawalPhase::Aborted(AbortReason::InsufficientFunds)));
        assert!(!WithdrawalPhase::Committed
            .can_transition_to(WithdrawalPhase::Aborted(AbortReason::InsufficientFunds)));
    }

    #[test]
    fn test_aborted_is_terminal() {
        let aborted = WithdrawalPhase::Aborted(AbortReason::StoreFailure);
        assert!(!aborted.can_transition_to(WithdrawalPhase::Started));
        assert!(!aborted.can_transition_to(WithdrawalPhase::Committed));
        assert!(!aborted.can_transition_to(WithdrawalPhase::Aborted(AbortReason::ConflictDetected)));
    }
}
