// DMPool CLI
// Operator commands against the running engine's API and the ledger backups

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use dmpool::auth::{ADMIN_ROLE, Authorizer};
use dmpool::backup::BackupManager;
use dmpool::config::Config;
use dmpool::ledger::MinerBalance;
use std::path::PathBuf;

/// DMPool reward engine CLI utility
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to dmpool config file
    #[arg(short, long, env("DMPOOL_CONFIG"), default_value = "config.toml")]
    config: String,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show miner balances
    Balances {
        /// Only this miner
        address: Option<String>,
    },
    /// Show payout history
    Payouts {
        #[arg(long)]
        address: Option<String>,
        /// pending, broadcast, confirmed or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show pending payouts older than the configured grace period
    Stuck,
    /// Show the PPLNS distribution of a credited block
    Block { height: u64 },
    /// Trigger a payout run now
    Run,
    /// Mint an admin token for the API
    Token {
        #[arg(long, default_value = "operator")]
        subject: String,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Back up the ledger now
    Backup,
    /// List available backups
    Backups,
    /// Verify a backup's checksum
    VerifyBackup { name: String },
    /// Restore the ledger from a backup. Stop the daemon first.
    Restore { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Balances { address } => match address {
            Some(address) => {
                let balance: MinerBalance =
                    api_get(&config, &format!("/api/v1/balances/{address}")).await?;
                println!("{}", format_balances(&[balance]));
            }
            None => {
                let balances: Vec<MinerBalance> = api_get(&config, "/api/v1/balances").await?;
                println!("{}", format_balances(&balances));
            }
        },
        Commands::Payouts {
            address,
            status,
            limit,
        } => {
            let mut path = format!("/api/v1/payouts?limit={limit}");
            if let Some(address) = address {
                path.push_str(&format!("&address={address}"));
            }
            if let Some(status) = status {
                path.push_str(&format!("&status={}", status.to_lowercase()));
            }
            print_json(&api_get::<serde_json::Value>(&config, &path).await?)?;
        }
        Commands::Stuck => {
            print_json(&api_get::<serde_json::Value>(&config, "/api/v1/payouts/stuck").await?)?;
        }
        Commands::Block { height } => {
            let path = format!("/api/v1/blocks/{height}");
            print_json(&api_get::<serde_json::Value>(&config, &path).await?)?;
        }
        Commands::Run => {
            let token = mint_token(&config, "dmpool_cli", TimeDelta::minutes(5))?;
            let url = api_url(&config, "/api/admin/payouts/run");
            let response = reqwest::Client::new()
                .post(&url)
                .bearer_auth(token)
                .send()
                .await
                .with_context(|| format!("Failed to connect to API at {url}. Is dmpool running?"))?;
            print_json(&read_response::<serde_json::Value>(response).await?)?;
        }
        Commands::Token { subject, hours } => {
            println!("{}", mint_token(&config, &subject, TimeDelta::hours(hours))?);
        }
        Commands::Backup => {
            let info = backup_manager(&config)?.backup().await?;
            println!(
                "Backup {} written ({} bytes, sha256 {})",
                info.metadata.backup_name, info.metadata.size_bytes, info.metadata.sha256
            );
        }
        Commands::Backups => {
            let backups = backup_manager(&config)?.list_backups()?;
            if backups.is_empty() {
                println!("No backups");
            }
            for backup in backups {
                println!(
                    "{}  {}  {} bytes",
                    backup.backup_name,
                    backup.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    backup.size_bytes
                );
            }
        }
        Commands::VerifyBackup { name } => {
            if backup_manager(&config)?.verify(&name)? {
                println!("Backup {name} is valid");
            } else {
                anyhow::bail!("Backup {name} failed verification");
            }
        }
        Commands::Restore { name } => {
            backup_manager(&config)?.restore(&name)?;
            println!("Ledger restored from {name}");
        }
    }

    Ok(())
}

fn api_url(config: &Config, path: &str) -> String {
    format!("http://{}:{}{}", config.api.hostname, config.api.port, path)
}

async fn api_get<T: serde::de::DeserializeOwned>(config: &Config, path: &str) -> Result<T> {
    let url = api_url(config, path);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to connect to API at {url}. Is dmpool running?"))?;
    read_response(response).await
}

async fn read_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("API returned status {status}: {body}");
    }
    Ok(response.json().await?)
}

fn mint_token(config: &Config, subject: &str, ttl: TimeDelta) -> Result<String> {
    Ok(Authorizer::new(&config.api.jwt_secret).issue_token(subject, ADMIN_ROLE, ttl)?)
}

/// Works on the ledger file directly; the store replaces it atomically so a
/// copy taken while the daemon runs is still consistent
fn backup_manager(config: &Config) -> Result<BackupManager> {
    let dir = config
        .backup
        .dir
        .as_ref()
        .context("backup.dir is not configured")?;
    BackupManager::new(
        PathBuf::from(&config.store.path),
        PathBuf::from(dir),
        config.backup.max_backups,
    )
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format balances as a human-readable text table
fn format_balances(balances: &[MinerBalance]) -> String {
    let mut output = String::with_capacity(balances.len() * 120);
    output.push_str(&format!(
        "{:<64} {:>16} {:>16} {:>16}\n",
        "address", "balance", "earned", "paid"
    ));
    output.push_str(&format!("{}\n", "=".repeat(115)));
    if balances.is_empty() {
        output.push_str("No balances\n");
    }
    for balance in balances {
        output.push_str(&format!(
            "{:<64} {:>16} {:>16} {:>16}\n",
            balance.address,
            balance.balance_satoshis,
            balance.total_earned_satoshis,
            balance.total_paid_satoshis
        ));
    }
    output
}
