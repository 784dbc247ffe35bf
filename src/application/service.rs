use std::future::Future;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::config::LedgerConfig;
use crate::domain::{
    AbortReason, AccountId, Amount, Decision, Entry, NewEntry, Withdrawal, validate_amount,
};
use crate::storage::{IsolationLevel, SqliteStore, Store};

use super::{LedgerError, RetryPolicy};

/// Settings the service applies to every transaction it opens.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub isolation: IsolationLevel,
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a committed withdrawal
#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalReceipt {
    pub entry: Entry,
    /// Balance read inside the committing transaction
    pub balance_before: Amount,
    pub balance_after: Amount,
    /// Attempts spent, including the one that committed
    pub attempts: u32,
}

/// Application service guarding account balances.
///
/// Every balance check and the debit it authorizes run inside one store
/// transaction at the configured isolation level. At serializable isolation
/// the store refuses one of two withdrawals that read the same balance, and
/// the refused one is retried from scratch with a fresh read.
pub struct LedgerService<S: Store> {
    store: S,
    config: ServiceConfig,
}

impl LedgerService<SqliteStore> {
    /// Connect to (and migrate) the database named in the configuration.
    pub async fn open(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let store =
            SqliteStore::init(&config.database.url, &config.database.sqlite_settings()).await?;
        Ok(Self::new(store, config.service_config()))
    }
}

impl<S: Store> LedgerService<S> {
    /// Create a new ledger service over the given store.
    pub fn new(store: S, config: ServiceConfig) -> Self {
        if config.isolation != IsolationLevel::Serializable {
            warn!(
                isolation = %config.isolation,
                "ledger isolation is below serializable; concurrent withdrawals can overdraw accounts"
            );
        }
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.config.isolation
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    // ========================
    // One-shot operations
    // ========================

    /// Current balance of an account. Zero for an account without entries.
    #[instrument(level = "debug", skip(self))]
    pub async fn balance(&self, account: AccountId) -> Result<Amount, LedgerError> {
        let (balance, _) = self
            .retrying("balance", account, move || self.balance_once(account))
            .await?;
        Ok(balance)
    }

    /// Credit an account. Never checks the balance.
    #[instrument(level = "debug", skip(self))]
    pub async fn deposit(&self, account: AccountId, amount: Amount) -> Result<Entry, LedgerError> {
        validate_amount(amount)?;
        let (entry, _) = self
            .retrying("deposit", account, move || self.deposit_once(account, amount))
            .await?;
        Ok(entry)
    }

    /// Debit an account if, and only if, its balance covers the amount.
    ///
    /// Conflicts reported by the store are retried within the retry policy;
    /// each retry re-reads the balance. Insufficient funds are never retried.
    #[instrument(level = "debug", skip(self))]
    pub async fn withdraw(
        &self,
        account: AccountId,
        amount: Amount,
    ) -> Result<WithdrawalReceipt, LedgerError> {
        validate_amount(amount)?;
        let (mut receipt, attempts) = self
            .retrying("withdraw", account, move || self.withdraw_once(account, amount))
            .await?;
        receipt.attempts = attempts;

        debug!(
            account,
            amount,
            attempts,
            balance_after = receipt.balance_after,
            "withdrawal committed"
        );
        Ok(receipt)
    }

    // ========================
    // Operations inside a caller-owned transaction
    // ========================

    /// Open a transaction at the service's isolation level.
    pub async fn begin(&self) -> Result<S::Txn, LedgerError> {
        Ok(self.store.begin(self.config.isolation).await?)
    }

    pub async fn commit(&self, txn: S::Txn) -> Result<(), LedgerError> {
        Ok(self.store.commit(txn).await?)
    }

    pub async fn rollback(&self, txn: S::Txn) -> Result<(), LedgerError> {
        Ok(self.store.rollback(txn).await?)
    }

    /// Balance as seen by `txn`, under that transaction's isolation level.
    pub async fn balance_in(
        &self,
        txn: &mut S::Txn,
        account: AccountId,
    ) -> Result<Amount, LedgerError> {
        Ok(self.store.sum(account, txn).await?)
    }

    pub async fn deposit_in(
        &self,
        txn: &mut S::Txn,
        account: AccountId,
        amount: Amount,
    ) -> Result<Entry, LedgerError> {
        validate_amount(amount)?;
        let entry = self
            .store
            .append(NewEntry::credit(account, amount), txn)
            .await?;
        debug!(account, amount, "deposit appended");
        Ok(entry)
    }

    /// Read the balance and append the debit inside `txn`.
    ///
    /// Returns the withdrawal in the `Appended` phase. Nothing is durable
    /// until the transaction commits, and the commit itself can still be
    /// refused with `ConflictDetected`.
    pub async fn withdraw_in(
        &self,
        txn: &mut S::Txn,
        account: AccountId,
        amount: Amount,
    ) -> Result<Withdrawal, LedgerError> {
        validate_amount(amount)?;
        let mut withdrawal = Withdrawal::start(account, amount);

        let balance = match self.store.sum(account, txn).await {
            Ok(balance) => balance,
            Err(err) => return Err(abort(&mut withdrawal, err.into())),
        };

        if withdrawal.observe_balance(balance)? == Decision::Rejected {
            withdrawal.abort(AbortReason::InsufficientFunds)?;
            debug!(account, amount, balance, "withdrawal rejected");
            return Err(LedgerError::InsufficientFunds {
                account,
                balance,
                required: amount,
            });
        }

        match self.store.append(withdrawal.debit(), txn).await {
            Ok(entry) => withdrawal.record_append(entry)?,
            Err(err) => return Err(abort(&mut withdrawal, err.into())),
        }

        debug!(account, amount, balance, "withdrawal appended");
        Ok(withdrawal)
    }

    /// Commit `txn` on behalf of `withdrawal`, tracking the outcome in its phase.
    pub async fn commit_withdrawal(
        &self,
        txn: S::Txn,
        withdrawal: &mut Withdrawal,
    ) -> Result<(), LedgerError> {
        withdrawal.record_commit()?;
        match self.commit(txn).await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(
                    account = withdrawal.account(),
                    amount = withdrawal.amount(),
                    error = %err,
                    "store refused withdrawal commit"
                );
                Err(abort(withdrawal, err))
            }
        }
    }

    // ========================
    // Single attempts
    // ========================

    async fn balance_once(&self, account: AccountId) -> Result<Amount, LedgerError> {
        let mut txn = self.begin().await?;
        match self.balance_in(&mut txn, account).await {
            Ok(balance) => {
                self.commit(txn).await?;
                Ok(balance)
            }
            Err(err) => {
                self.release(txn).await;
                Err(err)
            }
        }
    }

    async fn deposit_once(&self, account: AccountId, amount: Amount) -> Result<Entry, LedgerError> {
        let mut txn = self.begin().await?;
        match self.deposit_in(&mut txn, account, amount).await {
            Ok(entry) => {
                self.commit(txn).await?;
                Ok(entry)
            }
            Err(err) => {
                self.release(txn).await;
                Err(err)
            }
        }
    }

    async fn withdraw_once(
        &self,
        account: AccountId,
        amount: Amount,
    ) -> Result<WithdrawalReceipt, LedgerError> {
        let mut txn = self.begin().await?;
        let mut withdrawal = match self.withdraw_in(&mut txn, account, amount).await {
            Ok(withdrawal) => withdrawal,
            Err(err) => {
                self.release(txn).await;
                return Err(err);
            }
        };

        self.commit_withdrawal(txn, &mut withdrawal).await?;

        match (
            withdrawal.entry(),
            withdrawal.balance_before(),
            withdrawal.balance_after(),
        ) {
            (Some(entry), Some(balance_before), Some(balance_after)) => Ok(WithdrawalReceipt {
                entry: entry.clone(),
                balance_before,
                balance_after,
                attempts: 1,
            }),
            _ => Err(LedgerError::Database(anyhow::anyhow!(
                "withdrawal committed without recording its entry"
            ))),
        }
    }

    /// Roll back after a failed attempt. The original error wins over a
    /// rollback failure.
    async fn release(&self, txn: S::Txn) {
        if let Err(err) = self.store.rollback(txn).await {
            warn!(error = %err, "rollback failed");
        }
    }

    async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        account: AccountId,
        mut attempt_once: F,
    ) -> Result<(T, u32), LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let max_attempts = self.config.retry.attempts();
        let mut attempt = 1;

        loop {
            match attempt_once().await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        operation,
                        account,
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %err,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.with_attempts(attempt)),
            }
        }
    }
}

/// Move the withdrawal to its aborted phase and hand back the error.
fn abort(withdrawal: &mut Withdrawal, err: LedgerError) -> LedgerError {
    let reason = if err.is_conflict() {
        AbortReason::ConflictDetected
    } else {
        AbortReason::StoreFailure
    };

    match withdrawal.abort(reason) {
        Ok(()) => err,
        Err(invalid) => invalid.into(),
    }
}
