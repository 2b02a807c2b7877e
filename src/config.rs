//! Configuration.
//!
//! A validated `Config` struct built once at startup from a TOML file,
//! overlaid with environment variables (`dotenv::dotenv().ok()` then
//! `std::env::var(...)`). Unknown top-level TOML keys are rejected.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{Account, MarketPair};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHedgeModeConfig {
    pub hedge_ratio: f64,
    pub max_slippage: f64,
    pub min_spread_for_entry: f64,
    pub cancel_spread: f64,
    pub max_order_age_secs: i64,
    pub exposure_cap: f64,
    pub cool_down_secs: i64,
}

impl Default for MarketHedgeModeConfig {
    fn default() -> Self {
        Self {
            hedge_ratio: 1.0,
            max_slippage: 0.02,
            min_spread_for_entry: 0.02,
            cancel_spread: 0.005,
            max_order_age_secs: 60,
            exposure_cap: 5000.0,
            cool_down_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_backend")]
    pub backend: String,
    pub dsn: String,
}

fn default_db_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_true")]
    pub use_websocket: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// Telegram is an external collaborator (spec §1 Non-goals) — the engine
/// never sends a message itself, but the shape is recognized here so a
/// config file carrying a `[telegram]` section for some other process
/// reading the same file doesn't fail `deny_unknown_fields`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
}

/// Recognized top-level configuration. Deserialization with
/// `deny_unknown_fields` rejects anything else — a typo in a config file
/// fails fast instead of silently being ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub market_hedge_mode: MarketHedgeModeConfig,
    #[serde(default)]
    pub double_limit_enabled: bool,
    #[serde(default)]
    pub allow_partial_hedge: bool,
    #[serde(default)]
    pub multi_leg_enabled: bool,
    #[serde(default = "default_hedge_max_retries")]
    pub hedge_max_retries: u32,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rate_limits: HashMap<String, f64>,
    #[serde(default)]
    pub connectivity: HashMap<String, ConnectivityConfig>,
    pub accounts: Vec<Account>,
    pub market_pairs: Vec<MarketPair>,
    #[serde(default = "default_control_bind")]
    pub control_bind: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

fn default_hedge_max_retries() -> u32 {
    2
}

fn default_control_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    /// Loads `path` as TOML, then overlays a fixed set of environment
    /// variables (prefix `HEDGEBOT_`). Fails fast (exit code 2) on parse
    /// or validation error.
    pub fn load(path: &str) -> Result<Self> {
        dotenv::dotenv().ok();

        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        let mut config: Config = toml::from_str(&raw).with_context(|| format!("parsing config file {path}"))?;

        if let Ok(dsn) = std::env::var("HEDGEBOT_DATABASE_DSN") {
            config.database.dsn = dsn;
        }
        if let Ok(dry_run) = std::env::var("HEDGEBOT_DRY_RUN") {
            config.dry_run = dry_run.eq_ignore_ascii_case("true") || dry_run == "1";
        }
        if let Ok(bind) = std::env::var("HEDGEBOT_CONTROL_BIND") {
            config.control_bind = bind;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("no accounts configured");
        }
        if self.market_pairs.is_empty() {
            bail!("no enabled market pairs configured");
        }
        let account_ids: std::collections::HashSet<_> = self.accounts.iter().map(|a| a.id.as_str()).collect();
        for pair in &self.market_pairs {
            if !account_ids.contains(pair.account_a_id.as_str()) {
                bail!("market pair {} references unknown account_a_id {}", pair.pair_id, pair.account_a_id);
            }
            if !account_ids.contains(pair.account_b_id.as_str()) {
                bail!("market pair {} references unknown account_b_id {}", pair.pair_id, pair.account_b_id);
            }
        }
        Ok(())
    }

    pub fn max_order_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.market_hedge_mode.max_order_age_secs)
    }

    pub fn cool_down(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.market_hedge_mode.cool_down_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_keys() {
        let toml_str = r#"
            dry_run = true
            bogus_key = 1

            [database]
            dsn = "hedge.db"
        "#;
        let result: Result<Config, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn telegram_section_is_a_recognized_key() {
        let toml_str = r#"
            accounts = []
            market_pairs = []

            [database]
            dsn = "hedge.db"

            [telegram]
            enabled = true
            bot_token = "abc"
            chat_id = "123"
            heartbeat_secs = 60
        "#;
        let config: Config = toml::from_str(toml_str).expect("telegram section should parse");
        assert!(config.telegram.enabled);
        assert_eq!(config.telegram.heartbeat_secs, Some(60));
    }

    #[test]
    fn validate_rejects_empty_accounts() {
        let config = Config {
            dry_run: true,
            market_hedge_mode: MarketHedgeModeConfig::default(),
            double_limit_enabled: false,
            allow_partial_hedge: false,
            multi_leg_enabled: false,
            hedge_max_retries: 2,
            database: DatabaseConfig { backend: "sqlite".into(), dsn: ":memory:".into() },
            rate_limits: HashMap::new(),
            connectivity: HashMap::new(),
            accounts: vec![],
            market_pairs: vec![],
            control_bind: "127.0.0.1:8080".into(),
            poll_interval_ms: 500,
            telegram: TelegramConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
