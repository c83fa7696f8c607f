//! Configuration management for the trade copier.
//!
//! Loads settings from an optional config file layered under environment
//! variables (`COPIER__SECTION__KEY`).

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Account whose trades are copied
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Accounts trades are copied to
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    /// Dispatch, retry and polling behaviour
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// State database
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to reach a terminal bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Base URL of the bridge (e.g. http://127.0.0.1:8228)
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// Shared secret for request signing; empty disables signing
    #[serde(default)]
    pub bridge_secret: String,
    /// HTTP timeout per request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub terminal: TerminalConfig,
    /// Magic number stamped on provider duplicates
    #[serde(default = "default_duplicate_magic_number")]
    pub duplicate_magic_number: u64,
    /// Maximum price deviation accepted on market orders, in points
    #[serde(default = "default_deviation_points")]
    pub deviation_points: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub account_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default = "default_receiver_magic_number")]
    pub magic_number: u64,
    #[serde(default = "default_deviation_points")]
    pub deviation_points: u32,
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Per-receiver filter and sizing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Provider symbols to copy; empty copies everything
    #[serde(default)]
    pub allowed_symbols: Vec<String>,
    /// Provider symbols never copied
    #[serde(default)]
    pub denied_symbols: Vec<String>,
    /// Provider symbol -> receiver symbol (e.g. "XAUUSD" -> "GOLD")
    #[serde(default)]
    pub symbol_map: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub copy_buy: bool,
    #[serde(default = "default_true")]
    pub copy_sell: bool,
    /// Skip positions older than this many minutes (0 = no limit)
    #[serde(default = "default_max_position_age_minutes")]
    pub max_position_age_minutes: u32,
    /// Provider volume multiplier
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: Decimal,
    /// Fixed lot size overriding the multiplier
    #[serde(default)]
    pub fixed_volume: Option<Decimal>,
    /// Receiver volume step
    #[serde(default = "default_lot_step")]
    pub lot_step: Decimal,
    /// Smallest volume worth sending
    #[serde(default = "default_min_volume")]
    pub min_volume: Decimal,
    /// Volume cap
    #[serde(default)]
    pub max_volume: Option<Decimal>,
    /// Maximum concurrently tracked positions on this receiver
    #[serde(default)]
    pub max_open_positions: Option<usize>,
    /// Price offset widening the stop loss
    #[serde(default)]
    pub sl_offset: Decimal,
    /// Price offset widening the take profit
    #[serde(default)]
    pub tp_offset: Decimal,
    /// Scale of protective distances from the open price
    #[serde(default = "default_protective_distance_scale")]
    pub protective_distance_scale: Decimal,
}

/// Back-off shape for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Re-open every provider trade on the provider account as well
    #[serde(default)]
    pub duplicate_provider_trades: bool,
    /// Retry interval for provider duplicates
    #[serde(default = "default_duplicate_retry_interval")]
    pub duplicate_retry_interval_secs: u64,
    /// Retry interval for receivers
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Attempts per operation before the link is failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
    /// Upper bound for exponential back-off
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval_secs: u64,
    /// Broker codes that fail a receiver link immediately
    #[serde(default = "default_non_retryable_codes")]
    pub non_retryable_codes: Vec<i32>,
    /// Broker codes that fail a duplicate link immediately
    #[serde(default = "default_duplicate_non_retryable_codes")]
    pub duplicate_non_retryable_codes: Vec<i32>,
    /// Provider polling interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval between link reports
    #[serde(default = "default_diagnostics_interval")]
    pub diagnostics_interval_secs: u64,
    /// Upper bound for a single terminal call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Manual closes also close the provider's original position
    #[serde(default)]
    pub manual_close_includes_provider: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub file_name: String,
    /// Only log replication actions, not routine polling
    #[serde(default)]
    pub actions_only: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_bridge_url() -> String {
    "http://127.0.0.1:8228".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_duplicate_magic_number() -> u64 {
    234001
}
fn default_receiver_magic_number() -> u64 {
    234000
}
fn default_deviation_points() -> u32 {
    50
}
fn default_max_position_age_minutes() -> u32 {
    5
}
fn default_volume_multiplier() -> Decimal {
    dec!(1)
}
fn default_lot_step() -> Decimal {
    dec!(0.01)
}
fn default_min_volume() -> Decimal {
    dec!(0.01)
}
fn default_protective_distance_scale() -> Decimal {
    dec!(1)
}
fn default_duplicate_retry_interval() -> u64 {
    30
}
fn default_retry_interval() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff() -> BackoffKind {
    BackoffKind::Fixed
}
fn default_max_retry_interval() -> u64 {
    600
}
fn default_non_retryable_codes() -> Vec<i32> {
    // invalid request, volume, price, stops; market closed; filling mode
    vec![10013, 10014, 10015, 10016, 10018, 10030]
}
fn default_duplicate_non_retryable_codes() -> Vec<i32> {
    // algo trading disabled by client / server
    vec![10027, 10028]
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_diagnostics_interval() -> u64 {
    60
}
fn default_call_timeout() -> u64 {
    15
}
fn default_db_path() -> String {
    "data/copier_state.db".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_log_file() -> String {
    "trade-copier.log".to_string()
}

impl Config {
    /// Load configuration from `path` (or `config.*` in the working
    /// directory) and `COPIER__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name("config").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("COPIER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.provider.account_id.is_empty(),
            "provider.account_id must be set"
        );
        anyhow::ensure!(
            self.replication.duplicate_provider_trades
                || self.receivers.iter().any(|r| r.enabled),
            "no terminal connections configured: add an enabled receiver or enable duplicate_provider_trades"
        );
        anyhow::ensure!(
            self.replication.max_attempts >= 1,
            "replication.max_attempts must be at least 1"
        );
        anyhow::ensure!(
            self.replication.poll_interval_ms > 0,
            "replication.poll_interval_ms must be positive"
        );
        anyhow::ensure!(
            self.replication.call_timeout_secs > 0,
            "replication.call_timeout_secs must be positive"
        );

        let mut seen = std::collections::HashSet::new();
        for receiver in &self.receivers {
            anyhow::ensure!(
                !receiver.account_id.is_empty(),
                "receiver account_id must be set"
            );
            anyhow::ensure!(
                receiver.account_id != self.provider.account_id,
                "receiver {} is the provider account; use duplicate_provider_trades instead",
                receiver.account_id
            );
            anyhow::ensure!(
                seen.insert(receiver.account_id.as_str()),
                "receiver {} configured twice",
                receiver.account_id
            );
            receiver
                .filter
                .validate()
                .with_context(|| format!("invalid filter for receiver {}", receiver.account_id))?;
        }

        Ok(())
    }

    pub fn enabled_receivers(&self) -> impl Iterator<Item = &ReceiverConfig> {
        self.receivers.iter().filter(|r| r.enabled)
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.volume_multiplier > Decimal::ZERO,
            "volume_multiplier must be positive"
        );
        anyhow::ensure!(self.lot_step > Decimal::ZERO, "lot_step must be positive");
        anyhow::ensure!(
            self.min_volume >= Decimal::ZERO,
            "min_volume must not be negative"
        );
        if let Some(fixed) = self.fixed_volume {
            anyhow::ensure!(fixed > Decimal::ZERO, "fixed_volume must be positive");
        }
        if let Some(max) = self.max_volume {
            anyhow::ensure!(
                max >= self.min_volume,
                "max_volume must not be below min_volume"
            );
        }
        anyhow::ensure!(
            self.sl_offset >= Decimal::ZERO && self.tp_offset >= Decimal::ZERO,
            "protective offsets must not be negative"
        );
        anyhow::ensure!(
            self.protective_distance_scale > Decimal::ZERO,
            "protective_distance_scale must be positive"
        );
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                account_id: "provider".to_string(),
                ..ProviderConfig::default()
            },
            receivers: vec![ReceiverConfig::new("receiver-1")],
            replication: ReplicationConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            bridge_secret: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            terminal: TerminalConfig::default(),
            duplicate_magic_number: default_duplicate_magic_number(),
            deviation_points: default_deviation_points(),
        }
    }
}

impl ReceiverConfig {
    /// Enabled receiver with default terminal and filter settings.
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            enabled: true,
            terminal: TerminalConfig::default(),
            magic_number: default_receiver_magic_number(),
            deviation_points: default_deviation_points(),
            filter: FilterConfig::default(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            allowed_symbols: Vec::new(),
            denied_symbols: Vec::new(),
            symbol_map: HashMap::new(),
            copy_buy: true,
            copy_sell: true,
            max_position_age_minutes: default_max_position_age_minutes(),
            volume_multiplier: default_volume_multiplier(),
            fixed_volume: None,
            lot_step: default_lot_step(),
            min_volume: default_min_volume(),
            max_volume: None,
            max_open_positions: None,
            sl_offset: Decimal::ZERO,
            tp_offset: Decimal::ZERO,
            protective_distance_scale: default_protective_distance_scale(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            duplicate_provider_trades: false,
            duplicate_retry_interval_secs: default_duplicate_retry_interval(),
            retry_interval_secs: default_retry_interval(),
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            max_retry_interval_secs: default_max_retry_interval(),
            non_retryable_codes: default_non_retryable_codes(),
            duplicate_non_retryable_codes: default_duplicate_non_retryable_codes(),
            poll_interval_ms: default_poll_interval_ms(),
            diagnostics_interval_secs: default_diagnostics_interval(),
            call_timeout_secs: default_call_timeout(),
            manual_close_includes_provider: false,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            file_name: default_log_file(),
            actions_only: false,
        }
    }
}
