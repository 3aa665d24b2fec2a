//! Configuration management for the signal hub.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::market::Category;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scan cadence and worker pool
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Circuit breaker and correlation guard thresholds
    #[serde(default)]
    pub risk: RiskConfig,
    /// Signal bus backend
    #[serde(default)]
    pub bus: BusConfig,
    /// Client fan-out
    #[serde(default)]
    pub relay: RelayConfig,
    /// Position journal
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Outbound signal alerts
    #[serde(default)]
    pub alerts: AlertConfig,
    /// External decision provider
    #[serde(default)]
    pub decision: DecisionConfig,
    /// Instrument universe; empty means the built-in default universe
    #[serde(default)]
    pub instruments: Vec<InstrumentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pause between fully drained scan cycles
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Pause before retrying when the universe is empty
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
    /// Pause after a cycle-level failure
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Maximum instruments evaluated concurrently (upstream rate limits)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Upper bound of the random delay before each evaluation
    #[serde(default = "default_jitter_max")]
    pub jitter_max_ms: u64,
    /// Per-call decision provider timeout
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_secs: u64,
    /// Time granted to in-flight work on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Account balance the daily loss limit is measured against
    #[serde(default = "default_balance")]
    pub balance: Decimal,
    /// Maximum realized loss per UTC day as a fraction of balance (0.0-1.0)
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    /// Leading run of losing closes that trips the breaker
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Number of most recent closes inspected for the loss streak
    #[serde(default = "default_streak_lookback")]
    pub streak_lookback: usize,
    /// Open positions allowed per correlation group
    #[serde(default = "default_max_correlated_positions")]
    pub max_correlated_positions: usize,
    /// Fraction of balance risked per new position (0.0-1.0)
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: Decimal,
}

/// Signal bus storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Single-node, in-process map
    Memory,
    /// Shared hash + pub/sub for multi-node deployments
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_backend")]
    pub backend: BusBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Buffered change notifications per subscriber
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
    /// Lifetime of the duplicate-open marker; keep at or above one scan interval
    #[serde(default = "default_marker_ttl")]
    pub marker_ttl_secs: u64,
}

/// How the relay learns about bus changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Consume bus change notifications
    Pubsub,
    /// Poll the bus on `poll_interval_ms`
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_mode")]
    pub mode: RelayMode,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Queued updates per client before it is dropped as a slow consumer
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    /// Per-message socket write timeout
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    /// WebSocket listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Capacity of the open-position request queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Capacity of the outbound alert queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Telegram bot token; alerts are only logged when unset
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Base URL of the inference service; a hold-only provider is used when unset
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// One configured instrument. Unset fields are inferred from the symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub pip_scale: Option<Decimal>,
    #[serde(default)]
    pub lot_multiplier: Option<Decimal>,
    #[serde(default)]
    pub group: Option<String>,
}

// Default value functions
fn default_scan_interval() -> u64 {
    60
}

fn default_idle_interval() -> u64 {
    60
}

fn default_error_backoff() -> u64 {
    10
}

fn default_max_concurrency() -> usize {
    5 // Keeps upstream data/decision providers under their rate limits
}

fn default_jitter_max() -> u64 {
    50
}

fn default_decision_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_balance() -> Decimal {
    Decimal::new(1000, 0) // $1000 virtual system balance
}

fn default_max_daily_loss_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_streak_lookback() -> usize {
    10
}

fn default_max_correlated_positions() -> usize {
    2
}

fn default_risk_per_trade() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_bus_backend() -> BusBackend {
    BusBackend::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_notify_capacity() -> usize {
    1024
}

fn default_marker_ttl() -> u64 {
    120 // Two scan intervals
}

fn default_relay_mode() -> RelayMode {
    RelayMode::Pubsub
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_client_buffer() -> usize {
    64
}

fn default_send_timeout() -> u64 {
    2000
}

fn default_listen_addr() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_db_path() -> String {
    "data/signals.db".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("SIGNAL_HUB"),
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
            self.scheduler.max_concurrency >= 1,
            "max_concurrency must be at least 1"
        );

        anyhow::ensure!(
            self.scheduler.decision_timeout_secs >= 1,
            "decision_timeout_secs must be at least 1"
        );

        anyhow::ensure!(
            self.risk.balance > Decimal::ZERO,
            "balance must be positive"
        );

        anyhow::ensure!(
            self.risk.max_daily_loss_pct > Decimal::ZERO
                && self.risk.max_daily_loss_pct <= Decimal::ONE,
            "max_daily_loss_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.risk_per_trade > Decimal::ZERO && self.risk.risk_per_trade <= Decimal::ONE,
            "risk_per_trade must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.max_consecutive_losses >= 1
                && self.risk.streak_lookback >= self.risk.max_consecutive_losses as usize,
            "streak_lookback must cover max_consecutive_losses"
        );

        anyhow::ensure!(
            self.bus.notify_capacity >= 1 && self.relay.client_buffer >= 1,
            "notification buffers must hold at least one update"
        );

        anyhow::ensure!(
            self.bus.marker_ttl_secs >= self.scheduler.scan_interval_secs,
            "marker_ttl_secs must be at least scan_interval_secs"
        );

        anyhow::ensure!(
            self.relay.poll_interval_ms >= 1,
            "relay poll_interval_ms must be at least 1"
        );

        anyhow::ensure!(
            self.relay.send_timeout_ms >= 1,
            "relay send_timeout_ms must be at least 1"
        );

        anyhow::ensure!(
            self.alerts.telegram_bot_token.is_some() == self.alerts.telegram_chat_id.is_some(),
            "telegram_bot_token and telegram_chat_id must be set together"
        );

        Ok(())
    }
}

impl SchedulerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            idle_interval_secs: default_idle_interval(),
            error_backoff_secs: default_error_backoff(),
            max_concurrency: default_max_concurrency(),
            jitter_max_ms: default_jitter_max(),
            decision_timeout_secs: default_decision_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            balance: default_balance(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            streak_lookback: default_streak_lookback(),
            max_correlated_positions: default_max_correlated_positions(),
            risk_per_trade: default_risk_per_trade(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: default_bus_backend(),
            redis_url: default_redis_url(),
            notify_capacity: default_notify_capacity(),
            marker_ttl_secs: default_marker_ttl(),
        }
    }
}

impl BusConfig {
    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: default_relay_mode(),
            poll_interval_ms: default_poll_interval(),
            client_buffer: default_client_buffer(),
            send_timeout_ms: default_send_timeout(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            telegram_bot_token: None,
            telegram_chat_id: None,
            telegram_api_url: default_telegram_api_url(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let config = Config::default();
        assert_eq!(config.risk.max_daily_loss_pct, dec!(0.05));
        assert_eq!(config.risk.max_consecutive_losses, 5);
        assert_eq!(config.risk.streak_lookback, 10);
        assert_eq!(config.risk.max_correlated_positions, 2);
        assert_eq!(config.scheduler.max_concurrency, 5);
        assert_eq!(config.scheduler.scan_interval(), Duration::from_secs(60));
        assert!(config.bus.marker_ttl() >= config.scheduler.scan_interval());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.scheduler.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_relay_timings() {
        let mut config = Config::default();
        config.relay.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.send_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_marker_ttl_below_scan_interval() {
        let mut config = Config::default();
        config.bus.marker_ttl_secs = config.scheduler.scan_interval_secs - 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("marker_ttl_secs"));
    }

    #[test]
    fn test_rejects_half_configured_telegram() {
        let mut config = Config::default();
        config.alerts.telegram_bot_token = Some("token".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"risk": {"balance": "5000"}, "bus": {"backend": "redis"},
                "instruments": [{"symbol": "BBCA.JK"}]}"#,
        )
        .unwrap();

        assert_eq!(config.risk.balance, dec!(5000));
        assert_eq!(config.risk.max_consecutive_losses, 5);
        assert_eq!(config.bus.backend, BusBackend::Redis);
        assert_eq!(config.relay.mode, RelayMode::Pubsub);
        assert_eq!(config.instruments.len(), 1);
        assert!(config.instruments[0].category.is_none());
    }
}
