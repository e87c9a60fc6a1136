//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys, webhook URL, session cookie) are referenced by
//! env-var name in the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;

use crate::types::{DmarketSegment, SniperError};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    pub strategy: StrategyConfig,
    pub dmarket: DmarketConfig,
    pub skinport: SkinportConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Delay between two polls of the same DMarket segment.
    pub poll_interval_ms: u64,
    /// Reference price refresh interval. 0 fetches once at startup only.
    #[serde(default)]
    pub price_refresh_secs: u64,
    #[serde(default = "default_segments")]
    pub segments: Vec<DmarketSegment>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyConfig {
    pub min_profit_pct: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    #[serde(default = "default_restricted_marker")]
    pub restricted_marker: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DmarketConfig {
    pub public_key_env: String,
    pub private_key_env: String,
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SkinportConfig {
    pub enabled: bool,
    /// Overrides `strategy.min_price` for the sale feed.
    #[serde(default)]
    pub min_price: Option<Decimal>,
    /// Overrides `strategy.max_price` for the sale feed.
    #[serde(default)]
    pub max_price: Option<Decimal>,
    /// Env var holding a `connect.sid` cookie; the operator is asked when unset.
    #[serde(default)]
    pub session_env: Option<String>,
    #[serde(default = "default_max_reconnect_failures")]
    pub max_reconnect_failures: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationsConfig {
    pub webhook_url_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub directory: String,
    pub file_name: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: ".".to_string(),
            file_name: "logs.txt".to_string(),
            json: false,
        }
    }
}

fn default_segments() -> Vec<DmarketSegment> {
    vec![DmarketSegment::P2p, DmarketSegment::Dmarket]
}

fn default_restricted_marker() -> String {
    "StatTrak".to_string()
}

fn default_max_reconnect_failures() -> u32 {
    5
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SniperError> {
        if self.monitor.poll_interval_ms == 0 {
            return Err(SniperError::Config("poll_interval_ms must be positive".into()));
        }
        if self.strategy.min_price > self.strategy.max_price {
            return Err(SniperError::Config(format!(
                "min_price {} exceeds max_price {}",
                self.strategy.min_price, self.strategy.max_price
            )));
        }
        if self.strategy.min_price < Decimal::ZERO || self.strategy.min_profit_pct >= dec!(100) {
            return Err(SniperError::Config(
                "prices must be non-negative and min_profit_pct below 100".into(),
            ));
        }
        let (min, max) = self.skinport_bounds();
        if min > max {
            return Err(SniperError::Config(format!(
                "skinport min_price {min} exceeds max_price {max}"
            )));
        }
        Ok(())
    }

    /// Price bounds applied to the Skinport sale feed.
    pub fn skinport_bounds(&self) -> (Decimal, Decimal) {
        (
            self.skinport.min_price.unwrap_or(self.strategy.min_price),
            self.skinport.max_price.unwrap_or(self.strategy.max_price),
        )
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
