use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::{AccountId, Amount, Entry, NewEntry};

use super::{IsolationLevel, MIGRATION_001_ENTRIES, Store, StoreError};

// Primary SQLite result codes; extended codes keep these in the low byte.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Connection settings for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteSettings {
    pub max_connections: u32,
    /// How long a writer waits on another writer's lock before giving up
    pub busy_timeout: Duration,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Entry store persisted in a SQLite database.
///
/// Runs in WAL mode with deferred transactions: a transaction reads from the
/// snapshot taken by its first statement, and SQLite refuses to let it write
/// once another connection has committed on top of that snapshot. Execution is
/// therefore always serializable, whichever level is requested.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    /// Creates the database file if it doesn't exist.
    pub async fn connect(database_url: &str, settings: &SqliteSettings) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url: {}", database_url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(settings.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        tracing::debug!(database_url, "connected to sqlite store");
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_ENTRIES)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a database (connect + migrate).
    pub async fn init(database_url: &str, settings: &SqliteSettings) -> Result<Self> {
        let store = Self::connect(database_url, settings).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Count committed entries for an account.
    pub async fn entry_count(&self, account: AccountId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM entries WHERE account_id = ?")
            .bind(account)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count entries")?;

        Ok(row.get("count"))
    }

    /// List committed entries for an account in insertion order.
    pub async fn list_entries(&self, account: AccountId) -> Result<Vec<Entry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, amount, recorded_at
            FROM entries
            WHERE account_id = ?
            ORDER BY rowid
            "#,
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list entries")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn row_to_entry(row: &SqliteRow) -> Result<Entry> {
        let id_str: String = row.get("id");
        let recorded_at_str: String = row.get("recorded_at");

        Ok(Entry {
            id: Uuid::parse_str(&id_str).context("Invalid entry ID")?,
            account: row.get("account_id"),
            amount: row.get("amount"),
            recorded_at: DateTime::parse_from_rfc3339(&recorded_at_str)
                .context("Invalid recorded_at timestamp")?
                .with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    type Txn = Transaction<'static, Sqlite>;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Txn, StoreError> {
        // SQLite has no weaker level to offer; read-committed callers get serializable.
        tracing::trace!(%isolation, "begin sqlite transaction");
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn sum(&self, account: AccountId, txn: &mut Self::Txn) -> Result<Amount, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) as balance
            FROM entries
            WHERE account_id = ?
            "#,
        )
        .bind(account)
        .fetch_one(&mut **txn)
        .await
        .map_err(|e| map_sqlx_error("sum_entries", e))?;

        row.try_get("balance")
            .map_err(|e| map_sqlx_error("read_balance", e))
    }

    async fn append(&self, entry: NewEntry, txn: &mut Self::Txn) -> Result<Entry, StoreError> {
        let entry = entry.into_entry();

        sqlx::query(
            r#"
            INSERT INTO entries (id, account_id, amount, recorded_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.account)
        .bind(entry.amount)
        .bind(entry.recorded_at.to_rfc3339())
        .execute(&mut **txn)
        .await
        .map_err(|e| map_sqlx_error("insert_entry", e))?;

        Ok(entry)
    }

    async fn commit(&self, txn: Self::Txn) -> Result<(), StoreError> {
        txn.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&self, txn: Self::Txn) -> Result<(), StoreError> {
        txn.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(|code| code & 0xff);

            match primary {
                // BUSY covers BUSY_SNAPSHOT: our snapshot went stale under a concurrent commit
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => StoreError::Conflict(msg),
                _ => StoreError::Other(anyhow::anyhow!(msg)),
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => {
            StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err))
        }
        _ => StoreError::Other(anyhow::anyhow!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_unavailable() {
        let err = map_sqlx_error("begin_transaction", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        let err = map_sqlx_error("sum_entries", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Other(_)));
    }
}
