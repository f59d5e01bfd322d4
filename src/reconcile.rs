//! Reconciliation
//!
//! Brings the ledger back in line with the exchange after a disconnect or a
//! timed-out call. The exchange's open-order list is authoritative for what
//! is resting; the ledger is authoritative for what each order means. The
//! diff adopts resting orders of the current generation the ledger lost,
//! cancels orphans from superseded generations, and resolves ledger orders
//! the exchange no longer shows by consulting the fill history, so an order
//! outcome is never guessed.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::exchange::{CancelAck, ExecutionClient, OpenOrder};
use crate::ledger::{parse_client_order_id, LevelFill, ManagedOrder, OrderLedger, OrderState};

/// What one reconciliation pass found and fixed
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Resting exchange orders of the current generation the ledger lost
    pub adopted: usize,
    /// Stale-generation orders cancelled off the exchange
    pub orphans_cancelled: usize,
    /// Unresolved ledger orders that turned out to have filled. The caller
    /// replays replacement placement for these exactly once.
    pub resolved_fills: Vec<LevelFill>,
    /// Unresolved ledger orders that never reached the book
    pub resolved_cancelled: usize,
}

impl ReconcileReport {
    pub fn has_drift(&self) -> bool {
        self.adopted > 0
            || self.orphans_cancelled > 0
            || !self.resolved_fills.is_empty()
            || self.resolved_cancelled > 0
    }
}

/// One reconciliation pass. Every exchange call is bounded by
/// `call_timeout`; a failure aborts the pass and the caller retries on the
/// next timer tick.
pub async fn run_reconciliation(
    client: &dyn ExecutionClient,
    ledger: &mut OrderLedger,
    call_timeout: Duration,
) -> Result<ReconcileReport> {
    let open = timeout(call_timeout, client.list_open_orders())
        .await
        .context("listing open orders timed out")?
        .context("listing open orders failed")?;
    debug!(exchange_open = open.len(), "reconciling against exchange");

    let mut report = ReconcileReport::default();

    for order in &open {
        let Some((generation, level_index)) = parse_client_order_id(&order.client_order_id) else {
            // Not one of ours; leave it alone
            continue;
        };
        if generation != ledger.generation() {
            cancel_orphan(client, call_timeout, order, &mut report).await?;
            ledger.apply_cancelled(&order.client_order_id);
            continue;
        }
        match ledger.get(level_index) {
            Some(entry) if entry.is_open() => {
                // The submit made it through; a lost ack is the only drift
                if entry.state != OrderState::Live {
                    debug!(
                        client_order_id = %order.client_order_id,
                        "confirming unacked order as live"
                    );
                    ledger.mark_live(level_index);
                }
            }
            Some(_) => {
                // Locally terminal (e.g. a cancel that never landed); the
                // resting copy is an orphan now
                cancel_orphan(client, call_timeout, order, &mut report).await?;
            }
            None => {
                info!(
                    client_order_id = %order.client_order_id,
                    "adopting resting order unknown to the ledger"
                );
                ledger.adopt(ManagedOrder {
                    client_order_id: order.client_order_id.clone(),
                    generation,
                    level_index,
                    side: order.side,
                    price: order.price,
                    size: order.size,
                    state: OrderState::Live,
                    attempts: 1,
                });
                report.adopted += 1;
            }
        }
    }

    // Ledger orders the exchange no longer shows: resolve through the fill
    // history instead of assuming either outcome.
    let resting: std::collections::HashSet<&str> =
        open.iter().map(|o| o.client_order_id.as_str()).collect();
    for id in ledger.unresolved_ids() {
        if resting.contains(id.as_str()) {
            continue;
        }
        let fill = timeout(call_timeout, client.lookup_fill(&id))
            .await
            .context("fill lookup timed out")?
            .context("fill lookup failed")?;
        match fill {
            Some(f) => {
                info!(client_order_id = %id, price = %f.price, "unresolved order had filled");
                if let Some(level_fill) = ledger.apply_fill(&id, f.price, f.size) {
                    report.resolved_fills.push(level_fill);
                }
            }
            None => {
                debug!(client_order_id = %id, "unresolved order never reached the book");
                ledger.apply_cancelled(&id);
                report.resolved_cancelled += 1;
            }
        }
    }

    ledger.prune_retired();
    Ok(report)
}

async fn cancel_orphan(
    client: &dyn ExecutionClient,
    call_timeout: Duration,
    order: &OpenOrder,
    report: &mut ReconcileReport,
) -> Result<()> {
    warn!(client_order_id = %order.client_order_id, "cancelling orphaned order");
    let ack = timeout(call_timeout, client.cancel(&order.client_order_id))
        .await
        .context("orphan cancel timed out")?
        .context("orphan cancel failed")?;
    if ack == CancelAck::Accepted {
        report.orphans_cancelled += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderInstruction, PaperExchange};
    use crate::types::{Money, Side};

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn money(v: f64) -> Money {
        Money::from_f64(v)
    }

    fn seeded_ledger() -> OrderLedger {
        let mut ledger = OrderLedger::new();
        ledger.begin_generation(vec![
            (0, Side::Buy, money(48_000.0), money(0.01)),
            (1, Side::Buy, money(49_000.0), money(0.01)),
        ]);
        ledger
    }

    async fn rest_order(paper: &PaperExchange, id: &str, side: Side, price: f64) {
        paper
            .submit(OrderInstruction {
                client_order_id: id.to_string(),
                side,
                price: money(price),
                size: money(0.01),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_adopts_current_generation_order_ledger_lost() {
        let paper = PaperExchange::new(10_000.0, 50_000.0);
        rest_order(&paper, "grid-1-5", Side::Sell, 51_000.0).await;

        let mut ledger = seeded_ledger();
        let report = run_reconciliation(&paper, &mut ledger, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(report.adopted, 1);
        let adopted = ledger.get(5).unwrap();
        assert_eq!(adopted.state, OrderState::Live);
        assert_eq!(adopted.side, Side::Sell);
    }

    #[tokio::test]
    async fn test_cancels_stale_generation_orphans() {
        let paper = PaperExchange::new(10_000.0, 50_000.0);
        rest_order(&paper, "grid-1-0", Side::Buy, 48_000.0).await;

        let mut ledger = seeded_ledger();
        ledger.begin_generation(vec![(0, Side::Buy, money(52_000.0), money(0.01))]);
        assert_eq!(ledger.generation(), 2);

        let report = run_reconciliation(&paper, &mut ledger, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(report.orphans_cancelled, 1);
        assert!(paper.list_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leaves_foreign_orders_alone() {
        let paper = PaperExchange::new(10_000.0, 50_000.0);
        rest_order(&paper, "manual-hedge-1", Side::Sell, 60_000.0).await;

        let mut ledger = seeded_ledger();
        let report = run_reconciliation(&paper, &mut ledger, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(report.orphans_cancelled, 0);
        assert_eq!(paper.list_open_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolves_missing_order_as_fill_exactly_once() {
        let paper = PaperExchange::new(10_000.0, 50_000.0);
        rest_order(&paper, "grid-1-1", Side::Buy, 49_000.0).await;
        // Filled while we were disconnected
        paper.mark_price(48_500.0);

        let mut ledger = seeded_ledger();
        ledger.mark_submitting(1);
        ledger.mark_live(1);

        let report = run_reconciliation(&paper, &mut ledger, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(report.resolved_fills.len(), 1);
        assert!(report.resolved_fills[0].current_generation);
        assert_eq!(ledger.get(1).unwrap().state, OrderState::Filled);

        // A second pass finds nothing left to resolve
        let again = run_reconciliation(&paper, &mut ledger, TIMEOUT)
            .await
            .unwrap();
        assert!(again.resolved_fills.is_empty());
        assert!(!again.has_drift());
    }

    #[tokio::test]
    async fn test_resolves_missing_order_without_fill_as_cancelled() {
        let paper = PaperExchange::new(10_000.0, 50_000.0);

        // Ledger believes the submit went out; the exchange never saw it
        let mut ledger = seeded_ledger();
        ledger.mark_submitting(0);

        let report = run_reconciliation(&paper, &mut ledger, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(report.resolved_cancelled, 1);
        assert_eq!(ledger.get(0).unwrap().state, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn test_confirms_unacked_submit_found_resting() {
        let paper = PaperExchange::new(10_000.0, 50_000.0);
        rest_order(&paper, "grid-1-0", Side::Buy, 48_000.0).await;

        // Submit call timed out after the order had reached the book
        let mut ledger = seeded_ledger();
        ledger.mark_submitting(0);

        let report = run_reconciliation(&paper, &mut ledger, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(ledger.get(0).unwrap().state, OrderState::Live);
        assert!(report.resolved_fills.is_empty());
    }
}
