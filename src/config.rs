// 7.0 config.rs: all settings in one place. margin schedule, engine tuning,
// wallet defaults. loaded from defaults, then a TOML file, then PAPER_* env vars.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::EngineConfig;
use crate::margin::MarginParams;
use crate::types::{Leverage, Quote};

/** 7.1: wallet defaults. the product starts everyone at 10M quote units */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    // Balance for new wallets and resets
    pub initial_balance: Decimal,
    // Trade history rows returned when the caller gives no limit
    pub trade_history_limit: usize,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10_000_000),
            trade_history_limit: 30,
        }
    }
}

impl WalletConfig {
    pub fn initial_balance(&self) -> Quote {
        Quote::new(self.initial_balance)
    }
}

// Complete configuration for the paper trading engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub margin: MarginParams,
    pub engine: EngineConfig,
    pub wallet: WalletConfig,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            margin: MarginParams::default(),
            engine: EngineConfig::default(),
            wallet: WalletConfig::default(),
        }
    }
}

impl PaperConfig {
    // Lenient staleness for local runs against slow or replayed feeds
    pub fn development() -> Self {
        let mut config = Self::default();
        config.engine.staleness_window_ms = 60_000;
        config
    }

    // Lower leverage cap and a tight staleness window
    pub fn strict() -> Self {
        let mut config = Self::default();
        config.margin.max_leverage = Leverage::new(50).unwrap_or(Leverage::ONE);
        config.engine.staleness_window_ms = 1_000;
        config
    }

    /// Defaults, overlaid by `path` (if given) and then `PAPER_`-prefixed
    /// environment variables. Nested keys use `__`, e.g.
    /// `PAPER_ENGINE__STALENESS_WINDOW_MS=2000`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        use figment::providers::{Env, Format, Serialized, Toml};
        use figment::Figment;

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("PAPER_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        // margin checks
        let tiers = &self.margin.maintenance_tiers;
        if tiers.is_empty() {
            return Err(ConfigError::InvalidMargin {
                reason: "At least one maintenance tier is required".to_string(),
            });
        }

        let rate_ok = |rate: Decimal| rate > Decimal::ZERO && rate < Decimal::ONE;
        if !tiers.iter().all(|t| rate_ok(t.rate)) || !rate_ok(self.margin.fallback_rate) {
            return Err(ConfigError::InvalidMargin {
                reason: "Maintenance rates must be between 0 and 1".to_string(),
            });
        }

        // bounded tiers ascending, at most one unbounded tier and it comes last
        let bounds: Vec<Option<Decimal>> = tiers.iter().map(|t| t.max_notional).collect();
        let unbounded_before_end = bounds[..bounds.len() - 1].iter().any(Option::is_none);
        let ascending = bounds
            .iter()
            .flatten()
            .collect::<Vec<_>>()
            .windows(2)
            .all(|w| w[0] < w[1]);
        if unbounded_before_end || !ascending {
            return Err(ConfigError::InvalidMargin {
                reason: "Tier bounds must ascend with the unbounded tier last".to_string(),
            });
        }

        if self.margin.max_leverage.get() < 1 {
            return Err(ConfigError::InvalidMargin {
                reason: "Max leverage must be at least 1x".to_string(),
            });
        }

        // engine checks
        if self.engine.staleness_window_ms == 0 {
            return Err(ConfigError::InvalidEngine {
                reason: "Staleness window must be positive".to_string(),
            });
        }

        if self.engine.channel_capacity == 0 || self.engine.event_capacity == 0 {
            return Err(ConfigError::InvalidEngine {
                reason: "Channel capacities must be positive".to_string(),
            });
        }

        // wallet checks
        if self.wallet.initial_balance < Decimal::ZERO {
            return Err(ConfigError::InvalidWallet {
                reason: "Initial balance cannot be negative".to_string(),
            });
        }

        if self.wallet.trade_history_limit == 0 {
            return Err(ConfigError::InvalidWallet {
                reason: "Trade history limit must be positive".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid margin config: {reason}")]
    InvalidMargin { reason: String },

    #[error("Invalid engine config: {reason}")]
    InvalidEngine { reason: String },

    #[error("Invalid wallet config: {reason}")]
    InvalidWallet { reason: String },

    #[error("Could not load config: {reason}")]
    Load { reason: String },
}
