//! Grid planning
//!
//! Pure function from (configuration, reference price, account state) to an
//! ordered ladder of grid levels. The planner holds no state; level identity
//! across replans is the index, and the coordinator owns the generation
//! counter that distinguishes successive plans.

use tracing::debug;

use crate::config::{RangeMode, SpacingMode, StrategyConfig};
use crate::error::PlanError;
use crate::types::Side;

/// Relative tolerance for "level price coincides with the reference price".
/// A coincident level is skipped so the grid never self-fills at the center.
const CENTER_EPS: f64 = 1e-6;

/// One rung of the price ladder with a desired resting order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLevel {
    /// Position in the ladder, 0..N-1 by ascending price
    pub index: u32,
    pub price: f64,
    pub side: Side,
    /// Target order size in base units
    pub size: f64,
}

/// Output of a single (re)plan
#[derive(Debug, Clone)]
pub struct GridPlan {
    /// Reference price the grid was centered on
    pub center_price: f64,
    /// All N ladder prices, ascending, including rungs without an order
    /// (the center-coincident rung and zero-size sell rungs)
    rungs: Vec<f64>,
    /// Levels that carry an order, ascending by index
    pub levels: Vec<GridLevel>,
}

impl GridPlan {
    /// Ladder price at `index`, if the index is on the ladder
    pub fn rung_price(&self, index: u32) -> Option<f64> {
        self.rungs.get(index as usize).copied()
    }

    pub fn level(&self, index: u32) -> Option<&GridLevel> {
        self.levels.iter().find(|l| l.index == index)
    }

    /// Notional committed to buy levels
    pub fn buy_exposure(&self) -> f64 {
        self.levels
            .iter()
            .filter(|l| l.side == Side::Buy)
            .map(|l| l.price * l.size)
            .sum()
    }
}

/// Plan a fresh grid around `reference_price`.
///
/// Buy levels split `max_allocation_pct * balance` evenly in notional terms;
/// sell levels split the currently held `position` so aggregate sell exposure
/// can never exceed it. With no position the plan simply carries no sell
/// orders (sells appear as buy fills are replaced).
pub fn plan_grid(
    config: &StrategyConfig,
    reference_price: f64,
    balance: f64,
    position: f64,
) -> Result<GridPlan, PlanError> {
    if reference_price <= 0.0 || !reference_price.is_finite() {
        return Err(PlanError::NonPositivePrice(reference_price));
    }

    let (low, high) = match config.range {
        RangeMode::Auto { range_pct } => {
            let band = reference_price * range_pct / 100.0;
            (reference_price - band, reference_price + band)
        }
        RangeMode::Manual { low, high } => (low, high),
    };
    if low <= 0.0 || low >= high {
        return Err(PlanError::DegenerateRange {
            price: reference_price,
            low,
            high,
        });
    }

    let n = config.levels;
    let rungs: Vec<f64> = match config.spacing {
        SpacingMode::Linear => {
            let step = (high - low) / (n - 1) as f64;
            (0..n).map(|i| low + i as f64 * step).collect()
        }
        SpacingMode::Geometric => {
            let ratio = (high / low).powf(1.0 / (n - 1) as f64);
            (0..n).map(|i| low * ratio.powi(i as i32)).collect()
        }
    };

    // Classify rungs before sizing: the per-level allocation depends on the
    // effective buy count after the center rung is dropped.
    let mut sides: Vec<Option<Side>> = Vec::with_capacity(rungs.len());
    for &price in &rungs {
        if (price - reference_price).abs() <= reference_price * CENTER_EPS {
            sides.push(None);
        } else if price < reference_price {
            sides.push(Some(Side::Buy));
        } else {
            sides.push(Some(Side::Sell));
        }
    }
    let buy_count = sides.iter().filter(|s| **s == Some(Side::Buy)).count();
    let sell_count = sides.iter().filter(|s| **s == Some(Side::Sell)).count();

    let buy_notional_per_level = if buy_count > 0 {
        config.max_allocation_pct * balance / buy_count as f64
    } else {
        0.0
    };
    let sell_size_per_level = if sell_count > 0 && position > 0.0 {
        position / sell_count as f64
    } else {
        0.0
    };

    let min_size = config.execution.min_order_size;
    let mut levels = Vec::with_capacity(rungs.len());
    for (i, (&price, side)) in rungs.iter().zip(&sides).enumerate() {
        let index = i as u32;
        let side = match side {
            Some(side) => *side,
            None => {
                debug!(index, price, "skipping center-coincident grid level");
                continue;
            }
        };
        let size = match side {
            Side::Buy => buy_notional_per_level / price,
            Side::Sell => sell_size_per_level,
        };
        if side == Side::Buy && size < min_size {
            return Err(PlanError::SizeBelowMinimum {
                index,
                size,
                min: min_size,
            });
        }
        if side == Side::Sell && size < min_size {
            // Nothing to sell yet at this rung; sells materialize as buy
            // fills get replaced one level up.
            continue;
        }
        levels.push(GridLevel {
            index,
            price,
            side,
            size,
        });
    }

    debug!(
        center = reference_price,
        low,
        high,
        buys = buy_count,
        sells = levels.len() - levels.iter().filter(|l| l.side == Side::Buy).count(),
        "planned grid"
    );

    Ok(GridPlan {
        center_price: reference_price,
        rungs,
        levels,
    })
}
