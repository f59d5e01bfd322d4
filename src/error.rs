//! Error taxonomy for the engine
//!
//! Configuration errors are fatal at load and never raised mid-run. Plan
//! errors abort a (re)plan attempt. Everything transient (rejected orders,
//! communication failures, reconciliation drift) is handled in place by the
//! coordinator and surfaced through logs, not through these types.

use thiserror::Error;

/// Fatal configuration problems, detected before the engine starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("levels ({0}) must be >= 2")]
    TooFewLevels(u32),

    #[error("manual price range low ({low}) must be < high ({high})")]
    InvalidRange { low: f64, high: f64 },

    #[error("{name} ({value}) must be > 0 and <= {max}")]
    PercentOutOfRange {
        name: &'static str,
        value: f64,
        max: f64,
    },

    #[error("{name} ({value}) must be > 0")]
    NonPositive { name: &'static str, value: f64 },

    #[error("max_submit_attempts must be >= 1")]
    NoSubmitAttempts,
}

/// Grid planning failures for a specific reference price / balance
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("reference price ({0}) must be positive")]
    NonPositivePrice(f64),

    #[error("auto range around {price} collapsed: low {low} >= high {high}")]
    DegenerateRange { price: f64, low: f64, high: f64 },

    #[error("buy size {size} at level {index} is below the minimum order size {min}")]
    SizeBelowMinimum { index: u32, size: f64, min: f64 },
}
