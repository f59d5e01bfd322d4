//! Integration tests for the grid engine
//!
//! These tests drive the full engine through its public event queue against
//! the paper exchange and verify the end-to-end behavior: planning, fill
//! replacement, rebalancing, risk halts, reconciliation, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use grid_engine::config::{
    ExecutionConfig, RangeMode, RebalanceConfig, RiskConfig, SpacingMode, StrategyConfig,
};
use grid_engine::engine::{Engine, EngineEvent, EngineState, OrderUpdateKind};
use grid_engine::exchange::{ExecutionClient, FillReport, OrderInstruction, PaperExchange};
use grid_engine::ledger::parse_client_order_id;
use grid_engine::types::{Money, Side, Symbol};

// =============================================================================
// Test Utilities
// =============================================================================

fn test_config() -> StrategyConfig {
    StrategyConfig {
        symbol: Symbol::new("BTC"),
        levels: 10,
        range: RangeMode::Auto { range_pct: 5.0 },
        spacing: SpacingMode::Linear,
        max_allocation_pct: 0.5,
        risk: RiskConfig::default(),
        rebalance: RebalanceConfig {
            price_move_threshold_pct: 12.0,
        },
        execution: ExecutionConfig {
            retry_backoff_ms: 1,
            ..ExecutionConfig::default()
        },
    }
}

struct Session {
    paper: Arc<PaperExchange>,
    tx: mpsc::Sender<EngineEvent>,
    engine: JoinHandle<Engine>,
}

/// Spawn an engine on the paper exchange and bring it to ACTIVE at 50000
async fn start_session() -> Session {
    let paper = Arc::new(PaperExchange::new(10_000.0, 50_000.0));
    let (mut engine, tx) = Engine::new(test_config(), paper.clone());
    let handle = tokio::spawn(async move {
        engine.run().await.expect("engine run failed");
        engine
    });

    send_account(&tx, &paper).await;
    send_price(&tx, 50_000.0).await;
    settle(&tx).await;

    Session {
        paper,
        tx,
        engine: handle,
    }
}

async fn send_price(tx: &mpsc::Sender<EngineEvent>, price: f64) {
    tx.send(EngineEvent::PriceTick {
        timestamp: Utc::now(),
        price,
    })
    .await
    .expect("engine queue closed");
}

async fn send_account(tx: &mpsc::Sender<EngineEvent>, paper: &PaperExchange) {
    tx.send(EngineEvent::Account(paper.account_snapshot()))
        .await
        .expect("engine queue closed");
}

async fn send_fills(tx: &mpsc::Sender<EngineEvent>, fills: Vec<FillReport>) {
    for fill in fills {
        tx.send(EngineEvent::OrderUpdate {
            client_order_id: fill.client_order_id,
            kind: OrderUpdateKind::Filled {
                price: fill.price,
                size: fill.size,
            },
        })
        .await
        .expect("engine queue closed");
    }
}

/// Wait until the engine has drained everything queued so far. The queue is
/// FIFO, so once a Timer sent after our events is processed, so were they.
async fn settle(tx: &mpsc::Sender<EngineEvent>) {
    tx.send(EngineEvent::Timer).await.expect("engine queue closed");
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn finish(session: Session) -> Engine {
    session
        .tx
        .send(EngineEvent::Shutdown)
        .await
        .expect("engine queue closed");
    session.engine.await.expect("engine task panicked")
}

// =============================================================================
// End-to-end behavior
// =============================================================================

#[tokio::test]
async fn test_fill_replacement_round_trip_captures_spread() {
    let session = start_session().await;

    // Drop through the top buy rung, then rally through the replacement sell
    let buys = session.paper.mark_price(49_700.0);
    assert_eq!(buys.len(), 1);
    send_fills(&session.tx, buys).await;
    settle(&session.tx).await;

    let sells = session.paper.mark_price(50_300.0);
    assert_eq!(sells.len(), 1, "replacement sell must be resting");
    send_fills(&session.tx, sells).await;
    settle(&session.tx).await;

    let engine = finish(session).await;
    let status = engine.status();
    assert_eq!(status.state, EngineState::Stopped);
    assert_eq!(status.executed_trades, 2);
    assert!(status.realized_spread_pnl.is_positive());
}

#[tokio::test]
async fn test_rebalance_recenters_and_replaces_all_orders() {
    let session = start_session().await;

    // 13% up-move against a 12% threshold
    send_price(&session.tx, 56_500.0).await;
    settle(&session.tx).await;

    let open = session.paper.list_open_orders().await.unwrap();
    assert!(!open.is_empty());
    for order in &open {
        let (generation, _) = parse_client_order_id(&order.client_order_id).unwrap();
        assert_eq!(generation, 2, "all resting orders must be generation 2");
    }

    let engine = finish(session).await;
    assert_eq!(engine.status().generation, 2);
    assert_eq!(engine.status().center_price, Some(56_500.0));
}

#[tokio::test]
async fn test_drawdown_halt_is_sticky_across_the_event_stream() {
    let session = start_session().await;

    let mut bad = session.paper.account_snapshot();
    bad.account_value = 8_400.0;
    bad.peak_value = 10_000.0; // 16% drawdown vs 15% limit
    session
        .tx
        .send(EngineEvent::Account(bad))
        .await
        .unwrap();
    settle(&session.tx).await;
    assert!(session.paper.list_open_orders().await.unwrap().is_empty());

    // Healthy snapshots and big price moves must not revive trading
    send_account(&session.tx, &session.paper).await;
    send_price(&session.tx, 56_500.0).await;
    send_price(&session.tx, 43_000.0).await;
    settle(&session.tx).await;
    assert!(session.paper.list_open_orders().await.unwrap().is_empty());

    let engine = finish(session).await;
    assert_eq!(engine.status().executed_trades, 0);
}

#[tokio::test]
async fn test_startup_reconciliation_clears_previous_session_orders() {
    let paper = Arc::new(PaperExchange::new(10_000.0, 50_000.0));
    // Leftovers from an earlier run, plus a foreign order
    for (id, price) in [("grid-1-0", 47_600.0), ("grid-7-3", 48_800.0)] {
        paper
            .submit(OrderInstruction {
                client_order_id: id.to_string(),
                side: Side::Buy,
                price: Money::from_f64(price),
                size: Money::from_f64(0.01),
            })
            .await
            .unwrap();
    }
    paper
        .submit(OrderInstruction {
            client_order_id: "manual-hedge".to_string(),
            side: Side::Sell,
            price: Money::from_f64(60_000.0),
            size: Money::from_f64(0.5),
        })
        .await
        .unwrap();

    let (mut engine, tx) = Engine::new(test_config(), paper.clone());
    let handle = tokio::spawn(async move {
        engine.run().await.expect("engine run failed");
        engine
    });
    send_account(&tx, &paper).await;
    send_price(&tx, 50_000.0).await;
    settle(&tx).await;

    let open = paper.list_open_orders().await.unwrap();
    // Foreign order untouched; every grid order belongs to this run's grid
    assert!(open
        .iter()
        .any(|o| o.client_order_id == "manual-hedge"));
    let grid_orders: Vec<_> = open
        .iter()
        .filter(|o| o.client_order_id.starts_with("grid-"))
        .collect();
    assert_eq!(grid_orders.len(), 5);
    assert!(grid_orders
        .iter()
        .all(|o| parse_client_order_id(&o.client_order_id).unwrap().0 == 1));

    tx.send(EngineEvent::Shutdown).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_leaves_no_resting_orders() {
    let session = start_session().await;
    assert!(!session.paper.list_open_orders().await.unwrap().is_empty());

    let paper = session.paper.clone();
    let engine = finish(session).await;
    assert_eq!(engine.status().state, EngineState::Stopped);
    assert!(paper.list_open_orders().await.unwrap().is_empty());
}

// =============================================================================
// Randomized interleaving
// =============================================================================

/// Seeded random walk with fills, snapshots, and rebalances interleaved.
/// Every fill the exchange reports must be accounted for by the engine, and
/// the final shutdown must leave the book empty.
#[tokio::test]
async fn test_random_walk_accounts_for_every_fill() {
    let session = start_session().await;
    let mut rng = StdRng::seed_from_u64(7);
    let mut price = 50_000.0;
    let mut fills_sent = 0usize;

    for step in 0..200 {
        price *= 1.0 + rng.gen_range(-0.01..0.01);
        let fills = session.paper.mark_price(price);
        fills_sent += fills.len();
        send_fills(&session.tx, fills).await;
        send_price(&session.tx, price).await;
        if step % 10 == 0 {
            send_account(&session.tx, &session.paper).await;
        }
    }
    settle(&session.tx).await;

    // The book only ever holds orders of one generation at a time
    let open = session.paper.list_open_orders().await.unwrap();
    let generations: std::collections::HashSet<u64> = open
        .iter()
        .filter_map(|o| parse_client_order_id(&o.client_order_id))
        .map(|(generation, _)| generation)
        .collect();
    assert!(generations.len() <= 1, "mixed generations resting: {generations:?}");

    let paper = session.paper.clone();
    let engine = finish(session).await;
    assert_eq!(engine.status().executed_trades, fills_sent);
    assert!(paper.list_open_orders().await.unwrap().is_empty());
    assert_eq!(engine.status().open_orders, 0);
}
