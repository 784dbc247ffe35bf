//! Runtime configuration.
//!
//! Every section falls back to its defaults, so a partial JSON document such
//! as `{"retry": {"max_attempts": 10}}` is a complete configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::application::{BackoffStrategy, RetryPolicy, ServiceConfig};
use crate::storage::{IsolationLevel, SqliteSettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub isolation: IsolationLevel,
    pub retry: RetryConfig,
    pub database: DatabaseConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            retry: RetryConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl LedgerConfig {
    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input).context("Invalid ledger configuration")
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            isolation: self.isolation,
            retry: self.retry.policy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: millis(policy.base_delay),
            max_delay_ms: millis(policy.max_delay),
            backoff: policy.strategy,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            strategy: self.backoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL, e.g. `sqlite:ledger.db`
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let settings = SqliteSettings::default();
        Self {
            url: "sqlite:solvent.db".to_string(),
            max_connections: settings.max_connections,
            busy_timeout_ms: millis(settings.busy_timeout),
        }
    }
}

impl DatabaseConfig {
    pub fn sqlite_settings(&self) -> SqliteSettings {
        SqliteSettings {
            max_connections: self.max_connections,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
