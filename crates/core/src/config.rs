//! Application configuration.
//!
//! Configuration is immutable after load; the supervisor replaces it
//! atomically on `update_configuration`. Thresholds take effect on the next
//! detection tick, exchange auth changes on the next reconnect.

use crate::error::ExchangeError;
use crate::traits::Credentials;
use crate::types::TradingPair;
use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Master switch for detection.
    pub is_enabled: bool,
    /// Whether approved opportunities are handed to the executor.
    #[serde(alias = "auto_trade_enabled")]
    pub auto_execute_trades: bool,
    /// Route execution to the paper simulator instead of live venues.
    pub paper_trading_enabled: bool,
    /// Detector threshold, percent.
    pub minimum_profit_percentage: Decimal,
    /// Executor worker pool size.
    pub max_concurrent_arbitrage_operations: usize,
    /// Per-trade execution deadline.
    pub max_execution_time_ms: u64,
    /// REST polling interval when streaming is unavailable.
    pub polling_interval_ms: u64,
    /// Expected book update cadence, used by the staleness guard.
    pub expected_tick_interval_ms: u64,
    /// Minimum tradeable quantity in base units.
    pub min_trade_quantity: Decimal,
    /// Pairs to watch.
    pub trading_pairs: Vec<TradingPair>,
    /// Risk limits.
    pub risk_profile: RiskProfile,
    /// Persistence settings.
    pub database: DatabaseConfig,
    /// Per-exchange settings.
    pub exchanges: Vec<ExchangeConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            auto_execute_trades: false,
            paper_trading_enabled: true,
            minimum_profit_percentage: dec!(0.1),
            max_concurrent_arbitrage_operations: 4,
            max_execution_time_ms: 3000,
            polling_interval_ms: 1000,
            expected_tick_interval_ms: 500,
            min_trade_quantity: dec!(0.0001),
            trading_pairs: vec![TradingPair::new("BTC", "USDT")],
            risk_profile: RiskProfile::balanced(),
            database: DatabaseConfig::default(),
            exchanges: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Resolves the configuration path: the `ARB_CONFIG` environment
    /// variable when set, otherwise `config/Config.toml`.
    #[must_use]
    pub fn default_path() -> String {
        std::env::var("ARB_CONFIG").unwrap_or_else(|_| "config/Config.toml".to_string())
    }

    /// Loads and validates configuration from a TOML file merged with
    /// `ARB_`-prefixed environment overrides.
    ///
    /// Nested keys split on `__`: `ARB_DATABASE__MAX_CONNECTIONS=20`
    /// overrides `database.max_connections`, and
    /// `ARB_RISK_PROFILE__MAX_CONCURRENT_TRADES=1` overrides the risk
    /// profile. Exchange credentials are usually supplied this way so the
    /// file on disk carries no secrets.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ARB_").split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration ahead of component start.
    ///
    /// # Errors
    /// Returns `Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.trading_pairs.is_empty() {
            return Err(ExchangeError::Config("no trading pairs configured".into()));
        }
        if self.max_concurrent_arbitrage_operations == 0 {
            return Err(ExchangeError::Config(
                "max_concurrent_arbitrage_operations must be positive".into(),
            ));
        }
        if self.max_execution_time_ms == 0 {
            return Err(ExchangeError::Config(
                "max_execution_time_ms must be positive".into(),
            ));
        }
        if self.minimum_profit_percentage < Decimal::ZERO {
            return Err(ExchangeError::Config(
                "minimum_profit_percentage must be non-negative".into(),
            ));
        }
        let enabled: Vec<_> = self.exchanges.iter().filter(|e| e.is_enabled).collect();
        if enabled.len() < 2 {
            return Err(ExchangeError::Config(
                "cross-exchange arbitrage requires at least two enabled exchanges".into(),
            ));
        }
        for exchange in enabled {
            exchange.validate()?;
        }
        self.risk_profile.validate()?;
        Ok(())
    }

    /// Enabled exchange configs.
    pub fn enabled_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
        self.exchanges.iter().filter(|e| e.is_enabled)
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/cross_arb".to_string(),
            max_connections: 10,
        }
    }
}

/// Per-exchange connection and credential settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Stable identifier, e.g. `"coinbase"`.
    pub exchange_id: String,
    /// Whether this exchange participates.
    pub is_enabled: bool,
    /// API key identifier.
    #[serde(default)]
    pub api_key: String,
    /// API secret.
    #[serde(default)]
    pub api_secret: String,
    /// Auxiliary credentials, e.g. the Coinbase `passphrase`.
    #[serde(default)]
    pub additional_auth_params: HashMap<String, String>,
    /// REST base URL.
    pub api_url: String,
    /// WebSocket URL.
    pub ws_url: String,
    /// REST rate limit.
    #[serde(default = "default_requests_per_second")]
    pub max_requests_per_second: u32,
    /// REST request timeout.
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
    /// Base reconnect delay for the stream.
    #[serde(default = "default_ws_reconnect_interval_ms")]
    pub ws_reconnect_interval_ms: u64,
    /// Pairs the exchange supports; empty means all configured pairs.
    #[serde(default)]
    pub supported_trading_pairs: Vec<TradingPair>,
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_api_timeout_ms() -> u64 {
    5000
}

fn default_ws_reconnect_interval_ms() -> u64 {
    1000
}

impl ExchangeConfig {
    /// Builds credentials from the configured key material.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        let credentials = Credentials::new(self.api_key.clone(), self.api_secret.clone());
        match self.additional_auth_params.get("passphrase") {
            Some(passphrase) => credentials.with_passphrase(passphrase.clone()),
            None => credentials,
        }
    }

    /// Returns true when the exchange quotes the pair.
    #[must_use]
    pub fn supports_pair(&self, pair: &TradingPair) -> bool {
        self.supported_trading_pairs.is_empty() || self.supported_trading_pairs.contains(pair)
    }

    fn validate(&self) -> Result<(), ExchangeError> {
        if self.exchange_id.is_empty() {
            return Err(ExchangeError::Config("exchange_id must not be empty".into()));
        }
        if self.api_url.is_empty() && self.ws_url.is_empty() {
            return Err(ExchangeError::Config(format!(
                "{}: api_url or ws_url required",
                self.exchange_id
            )));
        }
        if self.max_requests_per_second == 0 {
            return Err(ExchangeError::Config(format!(
                "{}: max_requests_per_second must be positive",
                self.exchange_id
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Risk Profile
// =============================================================================

/// Risk limits applied per trade and per day.
///
/// Percentages are expressed as percents (`1.0` = 1%), fee rates elsewhere
/// as fractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskProfile {
    /// Maximum notional per trade as a percent of equity.
    pub max_capital_per_trade_pct: Decimal,
    /// Maximum exposure per base asset as a percent of equity.
    pub max_capital_per_asset_pct: Decimal,
    /// Minimum spread percent for an opportunity to qualify.
    pub min_profit_pct: Decimal,
    /// Maximum tolerated price offset from best book, percent.
    pub max_slippage_pct: Decimal,
    /// Stop-loss percent for a single trade.
    pub stop_loss_pct: Decimal,
    /// Daily realized-loss limit as a percent of day-start equity.
    pub daily_loss_limit_pct: Decimal,
    /// Maximum trades in flight at once.
    pub max_concurrent_trades: usize,
    /// Whether limit prices are bounded by `max_slippage_pct`.
    pub use_price_protection: bool,
}

impl RiskProfile {
    /// Tight limits for cautious operation.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_capital_per_trade_pct: dec!(5),
            max_capital_per_asset_pct: dec!(10),
            min_profit_pct: dec!(0.5),
            max_slippage_pct: dec!(0.1),
            stop_loss_pct: dec!(1),
            daily_loss_limit_pct: dec!(1),
            max_concurrent_trades: 1,
            use_price_protection: true,
        }
    }

    /// Default limits.
    #[must_use]
    pub fn balanced() -> Self {
        Self {
            max_capital_per_trade_pct: dec!(10),
            max_capital_per_asset_pct: dec!(25),
            min_profit_pct: dec!(0.2),
            max_slippage_pct: dec!(0.25),
            stop_loss_pct: dec!(2),
            daily_loss_limit_pct: dec!(3),
            max_concurrent_trades: 3,
            use_price_protection: true,
        }
    }

    /// Loose limits for aggressive operation.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_capital_per_trade_pct: dec!(25),
            max_capital_per_asset_pct: dec!(50),
            min_profit_pct: dec!(0.1),
            max_slippage_pct: dec!(0.5),
            stop_loss_pct: dec!(5),
            daily_loss_limit_pct: dec!(10),
            max_concurrent_trades: 8,
            use_price_protection: false,
        }
    }

    fn validate(&self) -> Result<(), ExchangeError> {
        if self.max_concurrent_trades == 0 {
            return Err(ExchangeError::Config(
                "risk_profile.max_concurrent_trades must be positive".into(),
            ));
        }
        if self.max_capital_per_trade_pct <= Decimal::ZERO {
            return Err(ExchangeError::Config(
                "risk_profile.max_capital_per_trade_pct must be positive".into(),
            ));
        }
        if self.daily_loss_limit_pct < Decimal::ZERO {
            return Err(ExchangeError::Config(
                "risk_profile.daily_loss_limit_pct must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RiskProfile {
    fn default() -> Self {
        Self::balanced()
    }
}

// =============================================================================
// Tests
// =============================================================================
