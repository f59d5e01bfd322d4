//! Rebalance trigger
//!
//! Watches reference-price drift against the active grid's center. The
//! trigger only decides; cancel-and-replant is the coordinator's job.

use crate::config::RebalanceConfig;

#[derive(Debug, Clone, Copy)]
pub struct RebalanceTrigger {
    threshold_pct: f64,
}

impl RebalanceTrigger {
    pub fn new(config: RebalanceConfig) -> Self {
        RebalanceTrigger {
            threshold_pct: config.price_move_threshold_pct,
        }
    }

    /// True when |price - center| / center reaches the configured threshold
    pub fn should_rebalance(&self, center_price: f64, price: f64) -> bool {
        if center_price <= 0.0 {
            return false;
        }
        let move_pct = (price - center_price).abs() / center_price * 100.0;
        move_pct >= self.threshold_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(threshold_pct: f64) -> RebalanceTrigger {
        RebalanceTrigger::new(RebalanceConfig {
            price_move_threshold_pct: threshold_pct,
        })
    }

    #[test]
    fn test_fires_past_threshold() {
        // 12% threshold, 13% move
        assert!(trigger(12.0).should_rebalance(50_000.0, 56_500.0));
    }

    #[test]
    fn test_quiet_inside_threshold() {
        assert!(!trigger(12.0).should_rebalance(50_000.0, 54_000.0));
    }

    #[test]
    fn test_fires_on_downside_moves_too() {
        assert!(trigger(12.0).should_rebalance(50_000.0, 43_000.0));
    }

    #[test]
    fn test_exact_threshold_fires() {
        assert!(trigger(10.0).should_rebalance(50_000.0, 55_000.0));
    }
}
