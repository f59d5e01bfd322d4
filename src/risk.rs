//! Risk monitoring
//!
//! Evaluates account snapshots against the configured limits and emits
//! verdicts. The monitor is stateless between snapshots; stickiness of the
//! halt verdict lives in the coordinator, which also applies the most
//! restrictive verdict when several rules fire at once.

use crate::config::RiskConfig;
use crate::types::AccountSnapshot;

/// Outcome of a risk evaluation, ordered by restrictiveness.
///
/// `Ok < ReduceOnly < ClosePosition < HaltTrading`, so the coordinator can
/// take the max over all fired rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskVerdict {
    Ok,
    /// Suppress new buy-side orders until the position shrinks below the cap
    ReduceOnly,
    /// Market-close the current position
    ClosePosition,
    /// Stop all trading; sticky until operator intervention
    HaltTrading,
}

/// One fired risk rule
#[derive(Debug, Clone)]
pub struct RiskBreach {
    pub rule: &'static str,
    pub verdict: RiskVerdict,
    pub reason: String,
}

/// Account-level risk rule evaluator
#[derive(Debug, Clone)]
pub struct RiskMonitor {
    config: RiskConfig,
}

impl RiskMonitor {
    pub fn new(config: RiskConfig) -> Self {
        RiskMonitor { config }
    }

    /// Evaluate every enabled rule against a snapshot.
    ///
    /// `mark_price` is the latest reference price, used to value the open
    /// position for the position-size cap.
    pub fn evaluate(&self, snapshot: &AccountSnapshot, mark_price: f64) -> Vec<RiskBreach> {
        let mut breaches = Vec::new();

        if let (Some(threshold), Some(pnl_pct)) =
            (self.config.stop_loss_pct, snapshot.unrealized_pnl_pct())
        {
            if pnl_pct <= -threshold {
                breaches.push(RiskBreach {
                    rule: "stop_loss",
                    verdict: RiskVerdict::ClosePosition,
                    reason: format!(
                        "unrealized loss {:.2}% exceeds stop loss {:.2}%",
                        -pnl_pct, threshold
                    ),
                });
            }
        }

        if let (Some(threshold), Some(pnl_pct)) =
            (self.config.take_profit_pct, snapshot.unrealized_pnl_pct())
        {
            if pnl_pct >= threshold {
                breaches.push(RiskBreach {
                    rule: "take_profit",
                    verdict: RiskVerdict::ClosePosition,
                    reason: format!(
                        "unrealized profit {:.2}% exceeds take profit {:.2}%",
                        pnl_pct, threshold
                    ),
                });
            }
        }

        if let Some(threshold) = self.config.max_drawdown_pct {
            let drawdown = snapshot.drawdown_pct();
            if drawdown >= threshold {
                breaches.push(RiskBreach {
                    rule: "max_drawdown",
                    verdict: RiskVerdict::HaltTrading,
                    reason: format!(
                        "drawdown {:.2}% exceeds maximum {:.2}%",
                        drawdown, threshold
                    ),
                });
            }
        }

        if let Some(threshold) = self.config.max_position_size_pct {
            if snapshot.balance > 0.0 {
                let position_value = snapshot.position_size.abs() * mark_price;
                let position_pct = position_value / snapshot.balance * 100.0;
                if position_pct > threshold {
                    breaches.push(RiskBreach {
                        rule: "max_position_size",
                        verdict: RiskVerdict::ReduceOnly,
                        reason: format!(
                            "position {:.2}% of balance exceeds cap {:.2}%",
                            position_pct, threshold
                        ),
                    });
                }
            }
        }

        breaches
    }

    /// Most restrictive verdict across the fired rules
    pub fn verdict(breaches: &[RiskBreach]) -> RiskVerdict {
        breaches
            .iter()
            .map(|b| b.verdict)
            .max()
            .unwrap_or(RiskVerdict::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> AccountSnapshot {
        AccountSnapshot {
            balance: 10_000.0,
            position_size: 0.0,
            entry_price: 0.0,
            account_value: 10_000.0,
            peak_value: 10_000.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    fn monitor() -> RiskMonitor {
        RiskMonitor::new(RiskConfig {
            stop_loss_pct: Some(8.0),
            take_profit_pct: Some(20.0),
            max_drawdown_pct: Some(15.0),
            max_position_size_pct: Some(30.0),
            close_cancels_orders: true,
        })
    }

    #[test]
    fn test_healthy_account_is_ok() {
        let breaches = monitor().evaluate(&snapshot(), 50_000.0);
        assert!(breaches.is_empty());
        assert_eq!(RiskMonitor::verdict(&breaches), RiskVerdict::Ok);
    }

    #[test]
    fn test_stop_loss_fires_close_position() {
        // Long 0.1 BTC from 50000, price dropped to 45900: 8.2% loss
        let mut snap = snapshot();
        snap.position_size = 0.1;
        snap.entry_price = 50_000.0;
        snap.unrealized_pnl = (45_900.0 - 50_000.0) * 0.1;

        let breaches = monitor().evaluate(&snap, 45_900.0);
        assert!(breaches.iter().any(|b| b.rule == "stop_loss"));
        assert_eq!(
            RiskMonitor::verdict(&breaches),
            RiskVerdict::ClosePosition
        );
    }

    #[test]
    fn test_take_profit_fires_close_position() {
        let mut snap = snapshot();
        snap.position_size = 0.1;
        snap.entry_price = 50_000.0;
        snap.unrealized_pnl = 1_100.0; // +22%

        let breaches = monitor().evaluate(&snap, 61_000.0);
        assert!(breaches.iter().any(|b| b.rule == "take_profit"));
    }

    #[test]
    fn test_drawdown_outranks_other_verdicts() {
        let mut snap = snapshot();
        snap.position_size = 0.1;
        snap.entry_price = 50_000.0;
        snap.unrealized_pnl = -500.0; // -10%, stop loss fires too
        snap.account_value = 8_400.0; // 16% drawdown
        snap.peak_value = 10_000.0;

        let breaches = monitor().evaluate(&snap, 45_000.0);
        assert!(breaches.len() >= 2);
        assert_eq!(RiskMonitor::verdict(&breaches), RiskVerdict::HaltTrading);
    }

    #[test]
    fn test_oversized_position_fires_reduce_only() {
        let mut snap = snapshot();
        snap.position_size = 0.1;
        snap.entry_price = 50_000.0;
        snap.unrealized_pnl = 0.0;

        // 0.1 * 50000 = 5000 = 50% of a 10000 balance
        let breaches = monitor().evaluate(&snap, 50_000.0);
        assert!(breaches.iter().any(|b| b.rule == "max_position_size"));
        assert_eq!(RiskMonitor::verdict(&breaches), RiskVerdict::ReduceOnly);
    }

    #[test]
    fn test_disabled_rules_never_fire() {
        let monitor = RiskMonitor::new(RiskConfig {
            stop_loss_pct: None,
            take_profit_pct: None,
            max_drawdown_pct: None,
            max_position_size_pct: None,
            close_cancels_orders: true,
        });
        let mut snap = snapshot();
        snap.position_size = 1.0;
        snap.entry_price = 50_000.0;
        snap.unrealized_pnl = -20_000.0;
        snap.account_value = 1_000.0;

        assert!(monitor.evaluate(&snap, 30_000.0).is_empty());
    }
}
