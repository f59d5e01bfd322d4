//! Execution coordination
//!
//! The single serializing actor that owns all mutable strategy state. Every
//! inbound notification (price tick, order update, account snapshot, timer,
//! shutdown) is normalized into one [`EngineEvent`] and pushed onto one
//! ordered queue; the coordinator drains it one event at a time, driving the
//! planner, risk monitor, and rebalance trigger and issuing exchange calls
//! through the [`ExecutionClient`] seam. Handling each event to completion
//! is what keeps a rebalance from ever racing a fill.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::StrategyConfig;
use crate::exchange::{CancelAck, ExecutionClient, OrderInstruction, SubmitAck};
use crate::ledger::{LevelFill, OrderLedger, OrderState};
use crate::planner::{plan_grid, GridPlan};
use crate::rebalance::RebalanceTrigger;
use crate::reconcile::run_reconciliation;
use crate::risk::{RiskMonitor, RiskVerdict};
use crate::types::{AccountSnapshot, Money, Side};

/// Capacity of the engine's event queue
const EVENT_QUEUE_DEPTH: usize = 256;

/// Everything the engine can react to, in one tagged type
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PriceTick {
        timestamp: DateTime<Utc>,
        price: f64,
    },
    OrderUpdate {
        client_order_id: String,
        kind: OrderUpdateKind,
    },
    Account(AccountSnapshot),
    Timer,
    Shutdown,
}

/// Exchange-side order lifecycle notifications
#[derive(Debug, Clone)]
pub enum OrderUpdateKind {
    Filled { price: Money, size: Money },
    Cancelled,
    Rejected { reason: String },
}

/// Engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Initializing,
    Active,
    Rebalancing,
    /// Risk halt; terminal until operator restart
    Halted,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Initializing => "initializing",
            EngineState::Active => "active",
            EngineState::Rebalancing => "rebalancing",
            EngineState::Halted => "halted",
            EngineState::ShuttingDown => "shutting_down",
            EngineState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Point-in-time view of the engine for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub generation: u64,
    pub open_orders: usize,
    pub executed_trades: usize,
    pub realized_spread_pnl: Money,
    pub center_price: Option<f64>,
    pub last_price: Option<f64>,
}

/// The grid strategy & risk coordination engine
pub struct Engine {
    config: StrategyConfig,
    client: Arc<dyn ExecutionClient>,
    ledger: OrderLedger,
    risk: RiskMonitor,
    trigger: RebalanceTrigger,
    state: EngineState,
    plan: Option<GridPlan>,
    last_price: Option<f64>,
    last_snapshot: Option<AccountSnapshot>,
    /// Sticky risk halt; never cleared by events
    halted: bool,
    reduce_only: bool,
    close_position_active: bool,
    shutdown_cancel_sent: bool,
    needs_reconcile: bool,
    executed_trades: usize,
    realized_spread_pnl: Money,
    /// FIFO lots of filled buys awaiting their harvesting sell
    open_lots: Vec<(Money, Money)>,
    rx: mpsc::Receiver<EngineEvent>,
}

impl Engine {
    /// Build an engine around a validated config. Returns the engine and the
    /// sender that producers (market data, order updates, account snapshots,
    /// timers, shutdown) push events through.
    pub fn new(
        config: StrategyConfig,
        client: Arc<dyn ExecutionClient>,
    ) -> (Self, mpsc::Sender<EngineEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let risk = RiskMonitor::new(config.risk);
        let trigger = RebalanceTrigger::new(config.rebalance);
        let engine = Engine {
            config,
            client,
            ledger: OrderLedger::new(),
            risk,
            trigger,
            state: EngineState::Initializing,
            plan: None,
            last_price: None,
            last_snapshot: None,
            halted: false,
            reduce_only: false,
            close_position_active: false,
            shutdown_cancel_sent: false,
            needs_reconcile: false,
            executed_trades: 0,
            realized_spread_pnl: Money::ZERO,
            open_lots: Vec::new(),
            rx,
        };
        (engine, tx)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            generation: self.ledger.generation(),
            open_orders: self.ledger.open_count(),
            executed_trades: self.executed_trades,
            realized_spread_pnl: self.realized_spread_pnl,
            center_price: self.plan.as_ref().map(|p| p.center_price),
            last_price: self.last_price,
        }
    }

    /// Drain the event queue until stopped
    pub async fn run(&mut self) -> Result<()> {
        info!(symbol = %self.config.symbol, "engine starting");
        while self.state != EngineState::Stopped {
            match self.rx.recv().await {
                Some(event) => self.handle_event(event).await?,
                None => {
                    // All producers dropped; drain like an operator shutdown
                    warn!("event queue closed, shutting down");
                    self.on_shutdown().await;
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::PriceTick { price, .. } => self.on_price(price).await,
            EngineEvent::OrderUpdate {
                client_order_id,
                kind,
            } => {
                self.on_order_update(&client_order_id, kind).await;
                Ok(())
            }
            EngineEvent::Account(snapshot) => self.on_account(snapshot).await,
            EngineEvent::Timer => {
                self.on_timer().await;
                Ok(())
            }
            EngineEvent::Shutdown => {
                self.on_shutdown().await;
                Ok(())
            }
        }
    }

    async fn on_price(&mut self, price: f64) -> Result<()> {
        self.last_price = Some(price);
        match self.state {
            EngineState::Initializing => self.try_start().await,
            EngineState::Active => {
                let center = self.plan.as_ref().map(|p| p.center_price);
                if let Some(center) = center {
                    if self.trigger.should_rebalance(center, price) {
                        return self.rebalance(center, price).await;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Leave INITIALIZING once both a reference price and an account
    /// snapshot have arrived: reconcile, plan the first grid, go ACTIVE.
    async fn try_start(&mut self) -> Result<()> {
        let (Some(price), Some(_)) = (self.last_price, self.last_snapshot.as_ref()) else {
            return Ok(());
        };
        self.reconcile().await;
        self.replant(price).await?;
        self.state = EngineState::Active;
        info!(
            generation = self.ledger.generation(),
            center = price,
            "engine active"
        );
        Ok(())
    }

    /// Plan a fresh grid around `center` and submit its orders
    async fn replant(&mut self, center: f64) -> Result<()> {
        let snapshot = self
            .last_snapshot
            .context("planning requires an account snapshot")?;
        let position = snapshot.position_size.max(0.0);
        let plan = plan_grid(&self.config, center, snapshot.balance, position)?;
        let generation = self.ledger.begin_generation(plan.levels.iter().map(|l| {
            (
                l.index,
                l.side,
                Money::from_f64(l.price),
                Money::from_f64(l.size),
            )
        }));
        info!(
            generation,
            center,
            levels = plan.levels.len(),
            "grid planned"
        );
        self.plan = Some(plan);
        self.submit_pending().await;
        Ok(())
    }

    /// Submit every Pending order of the current generation
    async fn submit_pending(&mut self) {
        let pending: Vec<u32> = self
            .ledger
            .entries()
            .filter(|o| o.state == OrderState::Pending)
            .map(|o| o.level_index)
            .collect();
        for level in pending {
            self.submit_level(level).await;
        }
    }

    /// Submit one level's order, consuming retry attempts on inline rejects.
    /// A timed-out or transport-failed call leaves the order Submitting and
    /// defers resolution to reconciliation; outcomes are never guessed.
    async fn submit_level(&mut self, level_index: u32) {
        loop {
            if self.halted
                || matches!(
                    self.state,
                    EngineState::Halted | EngineState::ShuttingDown | EngineState::Stopped
                )
            {
                return;
            }
            let (id, side, price, size, attempts_before) = match self.ledger.get(level_index) {
                Some(o) if o.state == OrderState::Pending => (
                    o.client_order_id.clone(),
                    o.side,
                    o.price,
                    o.size,
                    o.attempts,
                ),
                _ => return,
            };
            if self.reduce_only && side == Side::Buy {
                debug!(level_index, "reduce-only: buy submission suppressed");
                return;
            }

            self.ledger.mark_submitting(level_index);
            let call = self.client.submit(OrderInstruction {
                client_order_id: id.clone(),
                side,
                price,
                size,
            });
            match timeout(self.call_timeout(), call).await {
                Err(_) => {
                    warn!(
                        client_order_id = %id,
                        "submit timed out; order unresolved until reconciliation"
                    );
                    self.needs_reconcile = true;
                    return;
                }
                Ok(Err(err)) => {
                    warn!(
                        client_order_id = %id,
                        error = %err,
                        "submit failed; order unresolved until reconciliation"
                    );
                    self.needs_reconcile = true;
                    return;
                }
                Ok(Ok(SubmitAck::Accepted)) => {
                    debug!(client_order_id = %id, %side, %price, %size, "order live");
                    self.ledger.mark_live(level_index);
                    return;
                }
                Ok(Ok(SubmitAck::Rejected { reason })) => {
                    let attempts = attempts_before + 1;
                    if attempts >= self.config.execution.max_submit_attempts {
                        warn!(
                            client_order_id = %id,
                            attempts,
                            reason,
                            "order rejected, abandoning level"
                        );
                        self.ledger.mark_failed(level_index);
                        return;
                    }
                    let backoff = self.retry_backoff(attempts);
                    warn!(
                        client_order_id = %id,
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        reason,
                        "order rejected, retrying"
                    );
                    self.ledger.mark_pending_retry(level_index);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn on_order_update(&mut self, client_order_id: &str, kind: OrderUpdateKind) {
        match kind {
            OrderUpdateKind::Filled { price, size } => {
                if let Some(fill) = self.ledger.apply_fill(client_order_id, price, size) {
                    self.executed_trades += 1;
                    info!(
                        client_order_id,
                        side = %fill.side,
                        price = %fill.price,
                        size = %fill.size,
                        current = fill.current_generation,
                        "order filled"
                    );
                    self.record_fill_pnl(&fill);
                    self.maybe_replace(&fill).await;
                }
            }
            OrderUpdateKind::Cancelled => {
                if !self.ledger.apply_cancelled(client_order_id) {
                    warn!(client_order_id, "cancel ack for unknown order");
                }
            }
            OrderUpdateKind::Rejected { reason } => match self.ledger.apply_rejected(client_order_id) {
                Some((level, attempts)) => {
                    if attempts >= self.config.execution.max_submit_attempts {
                        warn!(client_order_id, attempts, reason, "order rejected, abandoning level");
                        self.ledger.mark_failed(level);
                    } else {
                        let backoff = self.retry_backoff(attempts);
                        warn!(
                            client_order_id,
                            attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            reason,
                            "order rejected, retrying"
                        );
                        self.ledger.mark_pending_retry(level);
                        tokio::time::sleep(backoff).await;
                        self.submit_level(level).await;
                    }
                }
                None => {
                    if self.ledger.get_by_id(client_order_id).is_none() {
                        warn!(client_order_id, reason, "reject for unknown order");
                    }
                }
            },
        }
    }

    /// Track spread-capture pnl: buys open FIFO lots, sells harvest them
    fn record_fill_pnl(&mut self, fill: &LevelFill) {
        match fill.side {
            Side::Buy => self.open_lots.push((fill.price, fill.size)),
            Side::Sell => {
                let mut remaining = fill.size;
                while remaining.is_positive() {
                    let Some((lot_price, lot_size)) = self.open_lots.first().copied() else {
                        break;
                    };
                    let take = remaining.min(lot_size);
                    self.realized_spread_pnl += (fill.price - lot_price) * take;
                    remaining -= take;
                    if take == lot_size {
                        self.open_lots.remove(0);
                    } else {
                        self.open_lots[0].1 = lot_size - take;
                    }
                }
            }
        }
    }

    /// Place the opposite-side replacement for a current-generation fill:
    /// a buy at level i replants a sell at i+1; a sell replants a buy at i-1.
    async fn maybe_replace(&mut self, fill: &LevelFill) {
        if !fill.current_generation {
            debug!(
                generation = fill.generation,
                level = fill.level_index,
                "late fill from superseded generation settled, no replacement"
            );
            return;
        }
        if self.halted
            || self.close_position_active
            || matches!(
                self.state,
                EngineState::Halted | EngineState::ShuttingDown | EngineState::Stopped
            )
        {
            return;
        }
        let (target, side) = match fill.side {
            Side::Buy => (fill.level_index + 1, Side::Sell),
            Side::Sell => {
                let Some(below) = fill.level_index.checked_sub(1) else {
                    debug!("sell fill at bottom rung, no replacement");
                    return;
                };
                (below, Side::Buy)
            }
        };
        let Some(price) = self.plan.as_ref().and_then(|p| p.rung_price(target)) else {
            debug!(level = fill.level_index, "fill at grid edge, no replacement rung");
            return;
        };
        if side == Side::Buy && self.reduce_only {
            debug!(level = target, "reduce-only: replacement buy suppressed");
            return;
        }
        let price = Money::from_f64(price);
        let inserted = self
            .ledger
            .insert_replacement(target, side, price, fill.size)
            .is_some();
        if inserted {
            info!(level = target, %side, %price, "placing replacement order");
            self.submit_level(target).await;
        } else {
            debug!(level = target, "replacement level already holds a live order");
        }
    }

    async fn on_account(&mut self, snapshot: AccountSnapshot) -> Result<()> {
        self.last_snapshot = Some(snapshot);
        if self.state == EngineState::Initializing {
            return self.try_start().await;
        }
        let Some(mark_price) = self.last_price else {
            return Ok(());
        };

        let breaches = self.risk.evaluate(&snapshot, mark_price);
        for breach in &breaches {
            warn!(rule = breach.rule, reason = %breach.reason, "risk rule fired");
        }
        let verdict = RiskMonitor::verdict(&breaches);
        let wants_close = breaches
            .iter()
            .any(|b| b.verdict == RiskVerdict::ClosePosition);

        if self.halted {
            // Sticky: a halted engine never re-evaluates its way back
            return Ok(());
        }
        match verdict {
            RiskVerdict::HaltTrading => {
                error!("halting trading until operator intervention");
                self.halted = true;
                self.state = EngineState::Halted;
                self.cancel_all_orders().await;
                if wants_close {
                    self.market_close_position(snapshot).await;
                }
            }
            RiskVerdict::ClosePosition => {
                if !self.close_position_active {
                    warn!("closing position on risk verdict");
                    self.close_position_active = true;
                    if self.config.risk.close_cancels_orders {
                        self.cancel_all_orders().await;
                    }
                    self.market_close_position(snapshot).await;
                }
            }
            RiskVerdict::ReduceOnly => {
                if !self.reduce_only {
                    warn!("position cap reached, suppressing new buys");
                    self.reduce_only = true;
                }
            }
            RiskVerdict::Ok => {
                self.close_position_active = false;
                if self.reduce_only {
                    info!("position back under cap, buys re-enabled");
                    self.reduce_only = false;
                    if self.state == EngineState::Active {
                        self.submit_pending().await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn market_close_position(&mut self, snapshot: AccountSnapshot) {
        let size = Money::from_f64(snapshot.position_size.max(0.0));
        if !size.is_positive() {
            return;
        }
        match timeout(self.call_timeout(), self.client.market_close(size)).await {
            Err(_) => {
                warn!("market close timed out; position unresolved until reconciliation");
                self.needs_reconcile = true;
            }
            Ok(Err(err)) => {
                warn!(error = %err, "market close failed");
                self.needs_reconcile = true;
            }
            Ok(Ok(())) => info!(%size, "position closed at market"),
        }
    }

    /// Cancel-and-replant around the drifted reference price
    async fn rebalance(&mut self, old_center: f64, new_center: f64) -> Result<()> {
        info!(
            old_center,
            new_center,
            generation = self.ledger.generation(),
            "price drift reached threshold, rebalancing"
        );
        self.state = EngineState::Rebalancing;
        self.cancel_all_orders().await;
        self.replant(new_center).await?;
        self.state = EngineState::Active;
        Ok(())
    }

    /// Cancel every open order, bounded per call. Idempotent via the ledger.
    async fn cancel_all_orders(&mut self) {
        let ids = self.ledger.cancel_all();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "cancelling open orders");
        for id in ids {
            match timeout(self.call_timeout(), self.client.cancel(&id)).await {
                Err(_) => {
                    warn!(client_order_id = %id, "cancel timed out");
                    self.needs_reconcile = true;
                }
                Ok(Err(err)) => {
                    warn!(client_order_id = %id, error = %err, "cancel failed");
                    self.needs_reconcile = true;
                }
                Ok(Ok(CancelAck::Accepted)) => {
                    debug!(client_order_id = %id, "order cancelled");
                }
                Ok(Ok(CancelAck::NotFound)) => {
                    // Likely filled while the cancel was in flight; the fill
                    // or reconciliation will settle it.
                    debug!(client_order_id = %id, "cancel target already gone");
                    self.needs_reconcile = true;
                }
            }
        }
    }

    async fn on_timer(&mut self) {
        if self.needs_reconcile && self.state != EngineState::Stopped {
            self.reconcile().await;
        }
        let status = self.status();
        debug!(
            state = %status.state,
            generation = status.generation,
            open_orders = status.open_orders,
            executed_trades = status.executed_trades,
            realized_spread_pnl = %status.realized_spread_pnl,
            "engine status"
        );
    }

    /// Align the ledger with the exchange's authoritative order set, then
    /// replay replacement logic for fills that happened while disconnected.
    async fn reconcile(&mut self) {
        let call_timeout = self.call_timeout();
        match run_reconciliation(self.client.as_ref(), &mut self.ledger, call_timeout).await {
            Ok(report) => {
                self.needs_reconcile = false;
                if report.has_drift() {
                    warn!(
                        adopted = report.adopted,
                        orphans_cancelled = report.orphans_cancelled,
                        resolved_fills = report.resolved_fills.len(),
                        resolved_cancelled = report.resolved_cancelled,
                        "reconciliation corrected drift"
                    );
                }
                for fill in report.resolved_fills {
                    self.executed_trades += 1;
                    self.record_fill_pnl(&fill);
                    self.maybe_replace(&fill).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "reconciliation failed, will retry");
                self.needs_reconcile = true;
            }
        }
    }

    /// Graceful drain: cancel-all exactly once, keep the position unless a
    /// close verdict was already in effect, then stop.
    async fn on_shutdown(&mut self) {
        if self.state == EngineState::Stopped {
            return;
        }
        info!("shutdown requested, draining");
        self.state = EngineState::ShuttingDown;
        if !self.shutdown_cancel_sent {
            self.shutdown_cancel_sent = true;
            self.cancel_all_orders().await;
            if self.close_position_active {
                if let Some(snapshot) = self.last_snapshot {
                    self.market_close_position(snapshot).await;
                }
            }
        }
        self.state = EngineState::Stopped;
        info!(
            executed_trades = self.executed_trades,
            realized_spread_pnl = %self.realized_spread_pnl,
            "engine stopped"
        );
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.execution.call_timeout_ms)
    }

    fn retry_backoff(&self, attempts: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts.saturating_sub(1));
        Duration::from_millis(self.config.execution.retry_backoff_ms.saturating_mul(factor))
    }
}
