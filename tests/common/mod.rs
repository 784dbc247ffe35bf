// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use solvent::application::{LedgerError, LedgerService, RetryPolicy, ServiceConfig};
use solvent::domain::{AccountId, Amount, Entry, NewEntry, WithdrawalPhase};
use solvent::storage::{
    IsolationLevel, MemoryStore, MemoryTxn, SqliteSettings, SqliteStore, Store, StoreError,
};
use tempfile::TempDir;
use tokio::sync::Barrier;

pub const ACCOUNT: AccountId = 1;

/// Retry policy with a 1ms fixed delay, so retries don't slow tests down.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
}

pub fn memory_service(isolation: IsolationLevel) -> LedgerService<MemoryStore> {
    memory_service_with(isolation, fast_retry(5))
}

pub fn memory_service_with(
    isolation: IsolationLevel,
    retry: RetryPolicy,
) -> LedgerService<MemoryStore> {
    LedgerService::new(MemoryStore::new(), ServiceConfig { isolation, retry })
}

/// Helper to create a service over a SQLite database in a temporary directory
pub async fn sqlite_service(
    retry: RetryPolicy,
    busy_timeout: Duration,
) -> Result<(LedgerService<SqliteStore>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let service = open_sqlite(&temp_dir, retry, busy_timeout).await?;
    Ok((service, temp_dir))
}

/// Open (or reopen) the ledger database living in `dir`.
pub async fn open_sqlite(
    dir: &TempDir,
    retry: RetryPolicy,
    busy_timeout: Duration,
) -> Result<LedgerService<SqliteStore>> {
    let db_path = dir.path().join("ledger.db");
    let url = format!("sqlite:{}", db_path.display());
    let settings = SqliteSettings {
        max_connections: 8,
        busy_timeout,
    };
    let store = SqliteStore::init(&url, &settings).await?;

    Ok(LedgerService::new(
        store,
        ServiceConfig {
            isolation: IsolationLevel::Serializable,
            retry,
        },
    ))
}

pub fn assert_insufficient(result: Result<impl std::fmt::Debug, LedgerError>, balance: Amount) {
    match result {
        Err(LedgerError::InsufficientFunds {
            balance: observed, ..
        }) => assert_eq!(observed, balance),
        other => panic!("expected InsufficientFunds, got {:?}", other),
    }
}

/// Memory store wrapper that misbehaves on cue.
///
/// - `compete_with`: right before one of the wrapped transaction's commits,
///   another transaction commits the queued entry, so the wrapped commit is
///   refused at serializable isolation.
/// - `fail_begins`: the next `n` calls to `begin` fail as unavailable.
#[derive(Default)]
pub struct ScriptedStore {
    inner: MemoryStore,
    competitors: Mutex<VecDeque<NewEntry>>,
    unavailable_begins: AtomicU32,
    begins: AtomicU32,
    commits: AtomicU32,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compete_with(&self, entry: NewEntry) {
        self.competitors.lock().unwrap().push_back(entry);
    }

    pub fn fail_begins(&self, n: u32) {
        self.unavailable_begins.store(n, Ordering::SeqCst);
    }

    pub fn begins(&self) -> u32 {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl Store for ScriptedStore {
    type Txn = MemoryTxn;

    async fn begin(&self, isolation: IsolationLevel) -> Result<MemoryTxn, StoreError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        let remaining = self.unavailable_begins.load(Ordering::SeqCst);
        if remaining > 0 {
            self.unavailable_begins.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("scripted outage".to_string()));
        }
        self.inner.begin(isolation).await
    }

    async fn sum(&self, account: AccountId, txn: &mut MemoryTxn) -> Result<Amount, StoreError> {
        self.inner.sum(account, txn).await
    }

    async fn append(&self, entry: NewEntry, txn: &mut MemoryTxn) -> Result<Entry, StoreError> {
        self.inner.append(entry, txn).await
    }

    async fn commit(&self, txn: MemoryTxn) -> Result<(), StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let competitor = self.competitors.lock().unwrap().pop_front();
        if let Some(entry) = competitor {
            let mut other = self.inner.begin(IsolationLevel::Serializable).await?;
            self.inner.append(entry, &mut other).await?;
            self.inner.commit(other).await?;
        }
        self.inner.commit(txn).await
    }

    async fn rollback(&self, txn: MemoryTxn) -> Result<(), StoreError> {
        self.inner.rollback(txn).await
    }
}

pub fn scripted_service(retry: RetryPolicy) -> LedgerService<ScriptedStore> {
    LedgerService::new(
        ScriptedStore::new(),
        ServiceConfig {
            isolation: IsolationLevel::Serializable,
            retry,
        },
    )
}

/// What one side of a withdrawal race saw.
#[derive(Debug)]
pub struct RaceOutcome {
    pub result: Result<(), LedgerError>,
    /// Final phase, when the withdrawal got far enough to be tracked
    pub phase: Option<WithdrawalPhase>,
}

/// Run one composed withdrawal per amount, all against the same account.
///
/// Every task reads the balance and appends its debit, then waits at a
/// barrier so that no transaction commits before all of them have read.
pub async fn race_withdrawals<S>(
    service: Arc<LedgerService<S>>,
    account: AccountId,
    amounts: &[Amount],
) -> Vec<RaceOutcome>
where
    S: Store + 'static,
{
    let barrier = Arc::new(Barrier::new(amounts.len()));
    let mut handles = Vec::with_capacity(amounts.len());

    for &amount in amounts {
        let service = Arc::clone(&service);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            let attempt = async {
                let mut txn = service.begin().await?;
                let withdrawal = service.withdraw_in(&mut txn, account, amount).await;
                Ok::<_, LedgerError>((txn, withdrawal))
            }
            .await;

            barrier.wait().await;

            match attempt {
                Ok((txn, Ok(mut withdrawal))) => {
                    let result = service.commit_withdrawal(txn, &mut withdrawal).await;
                    RaceOutcome {
                        result,
                        phase: Some(withdrawal.phase()),
                    }
                }
                Ok((txn, Err(err))) => {
                    let _ = service.rollback(txn).await;
                    RaceOutcome {
                        result: Err(err),
                        phase: None,
                    }
                }
                Err(err) => RaceOutcome {
                    result: Err(err),
                    phase: None,
                },
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.expect("race task panicked"));
    }
    outcomes
}
