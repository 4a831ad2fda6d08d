// Configuration module for DMPool
// Loads the reward engine configuration from TOML with environment overrides

use anyhow::{Context, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network};
use chrono::TimeDelta;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix, e.g. DMPOOL__PAYOUT__MIN_PAYOUT_SATOSHIS
const ENV_PREFIX: &str = "DMPOOL";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// The network can be "main", "testnet4", "signet" or "regtest"
    #[serde(deserialize_with = "deserialize_network")]
    pub network: Network,
    pub store: StoreConfig,
    pub bitcoinrpc: BitcoinRpcConfig,
    pub shares: SharesConfig,
    #[serde(default)]
    pub pplns: PplnsConfig,
    pub distributor: DistributorConfig,
    pub payout: PayoutConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// helper function to deserialize the network from the config file, which is provided as a string like Core
fn deserialize_network<'de, D>(deserializer: D) -> Result<Network, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Network::from_core_arg(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory holding the ledger state file
    pub path: String,
}

#[derive(Deserialize, Clone)]
pub struct BitcoinRpcConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for read-only calls. Broadcasts are never retried blindly.
    #[serde(default = "default_rpc_max_retries")]
    pub max_retries: u32,
}

/// Custom Debug to redact passwords
impl std::fmt::Debug for BitcoinRpcConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BitcoinRpcConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_rpc_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SharesConfig {
    /// PostgreSQL connection string of the share database written by the stratum server
    pub database_url: String,
    #[serde(default = "default_shares_pool_size")]
    pub pool_size: usize,
}

fn default_shares_pool_size() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct PplnsConfig {
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
    /// Pool fee in basis points, 100 = 1%
    #[serde(default = "default_pool_fee_bps")]
    pub pool_fee_bps: u16,
}

impl Default for PplnsConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
            pool_fee_bps: default_pool_fee_bps(),
        }
    }
}

impl PplnsConfig {
    pub fn ttl(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.ttl_days))
    }
}

fn default_ttl_days() -> u32 {
    7
}

fn default_pool_fee_bps() -> u16 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct DistributorConfig {
    #[serde(default = "default_distributor_poll_secs")]
    pub poll_interval_secs: u64,
    /// Confirmations before a coinbase is considered spendable
    #[serde(default = "default_maturity")]
    pub maturity_confirmations: u64,
    /// First height scanned when no block has been processed yet
    #[serde(default)]
    pub start_height: u64,
    /// Addresses the pool's coinbase pays to
    pub pool_addresses: Vec<String>,
    #[serde(default = "default_max_blocks_per_run")]
    pub max_blocks_per_run: u64,
}

fn default_distributor_poll_secs() -> u64 {
    120
}

fn default_maturity() -> u64 {
    100
}

fn default_max_blocks_per_run() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct PayoutConfig {
    #[serde(default = "default_min_payout")]
    pub min_payout_satoshis: u64,
    #[serde(default = "default_true")]
    pub auto_payout_enabled: bool,
    #[serde(default = "default_payout_interval_secs")]
    pub interval_secs: u64,
    /// Pool-controlled address receiving transaction change
    pub change_address: String,
    #[serde(default = "default_min_utxo_confirmations")]
    pub min_utxo_confirmations: u32,
    #[serde(default = "default_fee_conf_target")]
    pub fee_conf_target: u32,
    /// Used when the node has no fee estimate
    #[serde(default = "default_fallback_fee_rate")]
    pub fallback_fee_sat_per_vb: u64,
    /// A payout whose fee would exceed this is refused
    #[serde(default = "default_max_fee")]
    pub max_fee_satoshis: u64,
    #[serde(default = "default_max_attempts")]
    pub max_broadcast_attempts: u32,
    /// Pending payouts older than this are reported as stuck
    #[serde(default = "default_grace_minutes")]
    pub pending_grace_minutes: u64,
}

fn default_min_payout() -> u64 {
    1_000_000
}

fn default_true() -> bool {
    true
}

fn default_payout_interval_secs() -> u64 {
    3600
}

fn default_min_utxo_confirmations() -> u32 {
    1
}

fn default_fee_conf_target() -> u32 {
    6
}

fn default_fallback_fee_rate() -> u64 {
    2
}

fn default_max_fee() -> u64 {
    100_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_grace_minutes() -> u64 {
    60
}

impl PayoutConfig {
    pub fn pending_grace(&self) -> TimeDelta {
        TimeDelta::minutes(self.pending_grace_minutes as i64)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_threshold")]
    pub threshold: u32,
    #[serde(default = "default_confirmation_poll_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive checks a broadcast transaction may be unknown to the node before it is failed
    #[serde(default = "default_missing_checks")]
    pub missing_checks_before_failure: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            threshold: default_confirmation_threshold(),
            poll_interval_secs: default_confirmation_poll_secs(),
            missing_checks_before_failure: default_missing_checks(),
        }
    }
}

fn default_confirmation_threshold() -> u32 {
    6
}

fn default_confirmation_poll_secs() -> u64 {
    300
}

fn default_missing_checks() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertsConfig {
    /// Alerts are POSTed as JSON here; log-only when unset
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: HashMap<String, String>,
}

#[derive(Deserialize, Clone)]
pub struct ApiConfig {
    pub hostname: String,
    pub port: u16,
    /// HMAC secret for admin tokens
    pub jwt_secret: String,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ApiConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("jwt_secret", &"[redacted]")
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    pub dir: Option<String>,
    /// Zero disables scheduled backups
    #[serde(default)]
    pub interval_hours: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: None,
            interval_hours: 0,
            max_backups: default_max_backups(),
        }
    }
}

fn default_max_backups() -> usize {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (defaults to "info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("Failed to read config from {path}"))?
            .try_deserialize()
            .context("Failed to parse config")?;

        let validation = validate_config(&config);
        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }
        if !validation.is_valid {
            return Err(anyhow::anyhow!(
                "Invalid configuration: {}",
                validation.errors.join("; ")
            ));
        }
        Ok(config)
    }

    pub fn distributor_poll_interval(&self) -> Duration {
        Duration::from_secs(self.distributor.poll_interval_secs)
    }

    pub fn payout_interval(&self) -> Duration {
        Duration::from_secs(self.payout.interval_secs)
    }

    pub fn confirmation_poll_interval(&self) -> Duration {
        Duration::from_secs(self.confirmation.poll_interval_secs)
    }
}

/// Configuration validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    fn error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    fn warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

/// Parse an address and check it belongs to the configured network
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    let unchecked = Address::<NetworkUnchecked>::from_str(address)
        .with_context(|| format!("Invalid bitcoin address '{address}'"))?;
    unchecked
        .require_network(network)
        .with_context(|| format!("Address '{address}' is not valid for {network}"))
}

/// Validate configuration
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::valid();

    if config.pplns.pool_fee_bps > 10_000 {
        result.error(format!(
            "Pool fee {} bps exceeds 10000 (100%)",
            config.pplns.pool_fee_bps
        ));
    }
    if config.pplns.ttl_days < 1 {
        result.error("PPLNS TTL days must be at least 1".to_string());
    }

    if config.distributor.pool_addresses.is_empty() {
        result.error("distributor.pool_addresses must not be empty".to_string());
    }
    for address in &config.distributor.pool_addresses {
        if let Err(e) = parse_address(address, config.network) {
            result.error(format!("{e:#}"));
        }
    }
    if config.distributor.maturity_confirmations == 0 {
        result.error("distributor.maturity_confirmations must be non-zero".to_string());
    } else if config.distributor.maturity_confirmations < 100 {
        result.warning(format!(
            "Maturity of {} confirmations is below coinbase maturity (100)",
            config.distributor.maturity_confirmations
        ));
    }

    if let Err(e) = parse_address(&config.payout.change_address, config.network) {
        result.error(format!("payout.change_address: {e:#}"));
    }
    if config.payout.max_broadcast_attempts == 0 {
        result.error("payout.max_broadcast_attempts must be non-zero".to_string());
    }

    if config.confirmation.threshold == 0 {
        result.error("confirmation.threshold must be non-zero".to_string());
    }
    if config.confirmation.missing_checks_before_failure == 0 {
        result.error("confirmation.missing_checks_before_failure must be non-zero".to_string());
    }

    for (name, secs) in [
        ("distributor.poll_interval_secs", config.distributor.poll_interval_secs),
        ("payout.interval_secs", config.payout.interval_secs),
        ("confirmation.poll_interval_secs", config.confirmation.poll_interval_secs),
    ] {
        if secs == 0 {
            result.error(format!("{name} must be non-zero"));
        }
    }

    if config.api.jwt_secret.len() < 32 {
        result.error("api.jwt_secret must be at least 32 bytes".to_string());
    }
    if config.api.hostname != "127.0.0.1" && config.api.hostname != "localhost" {
        result.warning(format!(
            "API bound to '{}', admin endpoints are reachable beyond localhost",
            config.api.hostname
        ));
    }

    if !std::path::Path::new(&config.store.path).exists() {
        result.warning(format!(
            "Store path '{}' does not exist, will be created on startup",
            config.store.path
        ));
    }

    result
}
