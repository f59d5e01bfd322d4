//! Strategy configuration
//!
//! Loads a JSON configuration file into an immutable, fully validated
//! [`StrategyConfig`]. All range and enum checks run at load time so that
//! a configuration error can never surface mid-run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::types::Symbol;

/// How the grid price range is derived
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RangeMode {
    /// Symmetric band around the reference price: [P*(1-pct), P*(1+pct)]
    Auto { range_pct: f64 },
    /// Explicit price bounds
    Manual { low: f64, high: f64 },
}

/// How level prices are distributed across the range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpacingMode {
    /// Equal percentage intervals: price_i = low * (high/low)^(i/(N-1))
    #[default]
    Geometric,
    /// Equal price intervals: price_i = low + i * (high-low)/(N-1)
    Linear,
}

/// Risk thresholds, each optionally disabled with `null`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Close the position when unrealized loss reaches this percent
    pub stop_loss_pct: Option<f64>,
    /// Close the position when unrealized profit reaches this percent
    pub take_profit_pct: Option<f64>,
    /// Halt all trading when account drawdown reaches this percent
    pub max_drawdown_pct: Option<f64>,
    /// Suppress new buys while position value exceeds this percent of balance
    pub max_position_size_pct: Option<f64>,
    /// Whether a close-position verdict also cancels resting grid orders
    #[serde(default = "default_true")]
    pub close_cancels_orders: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            stop_loss_pct: Some(8.0),
            take_profit_pct: Some(20.0),
            max_drawdown_pct: Some(15.0),
            max_position_size_pct: Some(30.0),
            close_cancels_orders: true,
        }
    }
}

/// Rebalance trigger settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Replant the grid when the reference price drifts this far from center
    pub price_move_threshold_pct: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        RebalanceConfig {
            price_move_threshold_pct: 15.0,
        }
    }
}

/// Order submission and outbound-call settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Total submit attempts per order before giving up on the level
    pub max_submit_attempts: u32,
    /// Base delay for exponential backoff between resubmissions
    pub retry_backoff_ms: u64,
    /// Bound on every outbound exchange call
    pub call_timeout_ms: u64,
    /// Exchange minimum order size; smaller computed sizes fail the plan
    pub min_order_size: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            max_submit_attempts: 3,
            retry_backoff_ms: 250,
            call_timeout_ms: 5_000,
            min_order_size: 1e-8,
        }
    }
}

/// Immutable strategy configuration, validated at load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub symbol: Symbol,
    /// Number of grid levels (>= 2)
    pub levels: u32,
    pub range: RangeMode,
    #[serde(default)]
    pub spacing: SpacingMode,
    /// Fraction of account balance allocated across buy levels (0, 1]
    pub max_allocation_pct: f64,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl StrategyConfig {
    /// Load and validate configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: StrategyConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.validate().context("Invalid strategy configuration")?;
        Ok(config)
    }

    /// Check every invariant the engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.as_str().is_empty() {
            return Err(ConfigError::EmptySymbol);
        }
        if self.levels < 2 {
            return Err(ConfigError::TooFewLevels(self.levels));
        }
        match self.range {
            RangeMode::Auto { range_pct } => {
                check_pct("range_pct", range_pct, 100.0)?;
            }
            RangeMode::Manual { low, high } => {
                if low <= 0.0 {
                    return Err(ConfigError::NonPositive {
                        name: "range.low",
                        value: low,
                    });
                }
                if low >= high {
                    return Err(ConfigError::InvalidRange { low, high });
                }
            }
        }
        check_pct("max_allocation_pct", self.max_allocation_pct * 100.0, 100.0)?;
        if let Some(pct) = self.risk.stop_loss_pct {
            check_pct("stop_loss_pct", pct, 100.0)?;
        }
        if let Some(pct) = self.risk.take_profit_pct {
            check_pct("take_profit_pct", pct, f64::MAX)?;
        }
        if let Some(pct) = self.risk.max_drawdown_pct {
            check_pct("max_drawdown_pct", pct, 100.0)?;
        }
        if let Some(pct) = self.risk.max_position_size_pct {
            check_pct("max_position_size_pct", pct, f64::MAX)?;
        }
        check_pct(
            "price_move_threshold_pct",
            self.rebalance.price_move_threshold_pct,
            f64::MAX,
        )?;
        if self.execution.max_submit_attempts == 0 {
            return Err(ConfigError::NoSubmitAttempts);
        }
        if self.execution.min_order_size <= 0.0 {
            return Err(ConfigError::NonPositive {
                name: "execution.min_order_size",
                value: self.execution.min_order_size,
            });
        }
        Ok(())
    }
}

fn check_pct(name: &'static str, value: f64, max: f64) -> Result<(), ConfigError> {
    if value <= 0.0 || value > max || !value.is_finite() {
        return Err(ConfigError::PercentOutOfRange { name, value, max });
    }
    Ok(())
}
