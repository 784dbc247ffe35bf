use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use crate::application::{LedgerService, WithdrawalReceipt};
use crate::config::LedgerConfig;
use crate::domain::{AccountId, Amount, Entry};
use crate::storage::{IsolationLevel, SqliteStore};
use crate::telemetry;

/// Solvent - an append-only ledger that never overdraws
#[derive(Parser)]
#[command(name = "solvent")]
#[command(about = "Deposit, withdraw and inspect balances in an append-only ledger")]
#[command(version)]
pub struct Cli {
    /// Database URL
    #[arg(short, long, env = "SOLVENT_DATABASE", default_value = "sqlite:solvent.db")]
    pub database: String,

    /// Transaction isolation: serializable or read-committed
    #[arg(long, env = "SOLVENT_ISOLATION", default_value = "serializable")]
    pub isolation: String,

    /// Attempts per operation before a conflict is reported
    #[arg(long, env = "SOLVENT_MAX_ATTEMPTS", default_value = "5")]
    pub max_attempts: u32,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Credit an account
    Deposit {
        account: AccountId,
        /// Positive integer amount
        amount: Amount,
    },

    /// Debit an account if its balance covers the amount
    Withdraw {
        account: AccountId,
        /// Positive integer amount
        amount: Amount,
    },

    /// Show an account's balance
    Balance { account: AccountId },
}

impl Cli {
    pub fn config(&self) -> Result<LedgerConfig> {
        let isolation = IsolationLevel::from_str(&self.isolation)
            .ok_or_else(|| anyhow!("Invalid isolation level: {}", self.isolation))?;

        let mut config = LedgerConfig {
            isolation,
            ..Default::default()
        };
        config.database.url = self.database.clone();
        config.retry.max_attempts = self.max_attempts;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        telemetry::init(self.verbose);
        let config = self.config()?;

        if let Commands::Init = self.command {
            let service = LedgerService::open(&config).await?;
            service.store().close().await;
            println!("Initialized ledger at {}", config.database.url);
            return Ok(());
        }

        let service = LedgerService::open(&config)
            .await
            .context("Failed to open ledger")?;

        let result = self.execute(&service).await;
        service.store().close().await;
        result
    }

    async fn execute(&self, service: &LedgerService<SqliteStore>) -> Result<()> {
        match self.command {
            Commands::Init => Ok(()),
            Commands::Deposit { account, amount } => {
                let entry = service.deposit(account, amount).await?;
                self.print_entry(&entry)
            }
            Commands::Withdraw { account, amount } => {
                let receipt = service.withdraw(account, amount).await?;
                self.print_receipt(&receipt)
            }
            Commands::Balance { account } => {
                let balance = service.balance(account).await?;
                if self.json {
                    let body = serde_json::json!({ "account": account, "balance": balance });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                } else {
                    println!("Account {}: {}", account, balance);
                }
                Ok(())
            }
        }
    }

    fn print_entry(&self, entry: &Entry) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(entry)?);
        } else {
            let (verb, preposition) = if entry.is_credit() {
                ("Deposited", "into")
            } else {
                ("Debited", "from")
            };
            println!(
                "{} {} {} account {} (entry {})",
                verb,
                entry.amount.abs(),
                preposition,
                entry.account,
                entry.id
            );
        }
        Ok(())
    }

    fn print_receipt(&self, receipt: &WithdrawalReceipt) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(receipt)?);
        } else {
            println!(
                "Withdrew {} from account {}: {} -> {} (entry {}, {} attempt(s))",
                receipt.entry.amount.abs(),
                receipt.entry.account,
                receipt.balance_before,
                receipt.balance_after,
                receipt.entry.id,
                receipt.attempts
            );
        }
        Ok(())
    }
}
