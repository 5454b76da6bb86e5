// src/config.rs

use crate::advisor::cache::CachePolicy;
use crate::core::risk::RiskConfig;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub secret_key: String,
    pub base_url: String,
    pub recv_window_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            base_url: "https://api.binance.com".to_string(),
            recv_window_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdvisorConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub enable_cache: bool,
    // Relative price move below which a cached decision is reused
    pub cache_threshold: f64,
    pub cache_max_age_secs: u64,
    pub hold_reuse_secs: u64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 1024,
            enable_cache: true,
            cache_threshold: 0.001,
            cache_max_age_secs: 120,
            hold_reuse_secs: 60,
        }
    }
}

impl AdvisorConfig {
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            enabled: self.enable_cache,
            price_threshold: self.cache_threshold,
            max_age: Duration::from_secs(self.cache_max_age_secs),
            hold_reuse: Duration::from_secs(self.hold_reuse_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub decision_interval_secs: u64,
    pub max_position: f64, // base asset
    pub initial_balance: Option<f64>,
    pub dry_run: bool,
    pub step_size: Decimal,
    pub fee_rate: f64,
    pub enable_multi_timeframe: bool,
    pub enable_order_book: bool,
    pub sync_balance: bool,
    pub request_timeout_secs: u64,
    pub summary_every: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            decision_interval_secs: 60,
            max_position: 0.01,
            initial_balance: None,
            dry_run: true,
            step_size: Decimal::new(1, 5), // 0.00001
            fee_rate: 0.001,
            enable_multi_timeframe: true,
            enable_order_book: true,
            sync_balance: false,
            request_timeout_secs: 30,
            summary_every: 10,
        }
    }
}

impl EngineConfig {
    pub fn decision_interval(&self) -> Duration {
        Duration::from_secs(self.decision_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub directory: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: "logs".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub advisor: AdvisorConfig,
    pub engine: EngineConfig,
    pub risk: RiskConfig,
    pub log: LogConfig,
    pub ui: UiConfig,
}

impl AppConfig {
    /// Loads `Settings.*` (optional) overlaid with `APP_*` environment
    /// variables, e.g. `APP_ENGINE__DRY_RUN=false`.
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.engine.symbol.trim().is_empty() {
            return fail("engine.symbol must not be empty");
        }
        if self.engine.decision_interval_secs == 0 {
            return fail("engine.decision_interval_secs must be positive");
        }
        if self.engine.max_position <= 0.0 {
            return fail("engine.max_position must be positive");
        }
        if !self.engine.dry_run
            && (self.exchange.api_key.is_empty() || self.exchange.secret_key.is_empty())
        {
            return fail("exchange.api_key and exchange.secret_key are required for live trading");
        }

        let risk = &self.risk;
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(risk.max_position_ratio) {
            return fail("risk.max_position_ratio must be in (0, 1]");
        }
        if !in_unit(risk.max_drawdown) {
            return fail("risk.max_drawdown must be in (0, 1]");
        }
        if !in_unit(risk.daily_loss_limit) {
            return fail("risk.daily_loss_limit must be in (0, 1]");
        }
        if risk.min_confidence > 100 {
            return fail("risk.min_confidence must be within 0..=100");
        }
        if risk.max_trades_per_hour == 0 {
            return fail("risk.max_trades_per_hour must be positive");
        }
        Ok(())
    }
}
