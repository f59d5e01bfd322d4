//! Execution interface
//!
//! The narrow seam between the engine and the exchange. All calls are
//! idempotent keyed by client order id; the coordinator bounds each call
//! with a timeout and never infers an outcome from a timed-out call.
//!
//! Ships a paper-trading client that fills resting limit orders when the
//! reference price crosses them. It backs the `run --paper` command and
//! doubles as the test double for the coordinator.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{AccountSnapshot, Money, Side};

/// A single limit order instruction
#[derive(Debug, Clone)]
pub struct OrderInstruction {
    pub client_order_id: String,
    pub side: Side,
    pub price: Money,
    pub size: Money,
}

/// Outcome of a submit call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitAck {
    Accepted,
    Rejected { reason: String },
}

/// Outcome of a cancel call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Accepted,
    NotFound,
}

/// An order resting on the exchange, as reported by the exchange
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub client_order_id: String,
    pub side: Side,
    pub price: Money,
    pub size: Money,
}

/// Terminal fill record from the exchange's trade history
#[derive(Debug, Clone)]
pub struct FillReport {
    pub client_order_id: String,
    pub price: Money,
    pub size: Money,
    pub timestamp: DateTime<Utc>,
}

/// External order execution interface.
///
/// Implementations wrap the real exchange transport; the engine only ever
/// sees this trait.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn submit(&self, order: OrderInstruction) -> Result<SubmitAck>;
    async fn cancel(&self, client_order_id: &str) -> Result<CancelAck>;
    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>>;
    /// Look up whether a no-longer-open order ended in a fill
    async fn lookup_fill(&self, client_order_id: &str) -> Result<Option<FillReport>>;
    /// Close `size` base units of the current position at market
    async fn market_close(&self, size: Money) -> Result<()>;
}

// ============================================================================
// Paper trading client
// ============================================================================

#[derive(Debug)]
struct PaperBook {
    open: HashMap<String, OpenOrder>,
    fills: HashMap<String, FillReport>,
    last_price: f64,
    cash: f64,
    position: f64,
    cost_basis: f64,
    realized_pnl: f64,
    peak_value: f64,
}

/// In-memory execution client with price-cross fills
pub struct PaperExchange {
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(starting_cash: f64, starting_price: f64) -> Self {
        PaperExchange {
            book: Mutex::new(PaperBook {
                open: HashMap::new(),
                fills: HashMap::new(),
                last_price: starting_price,
                cash: starting_cash,
                position: 0.0,
                cost_basis: 0.0,
                realized_pnl: 0.0,
                peak_value: starting_cash,
            }),
        }
    }

    /// Advance the paper market to `price`, filling every resting order the
    /// move crossed. Returns the fill reports for the caller to feed back
    /// into the engine's event queue.
    pub fn mark_price(&self, price: f64) -> Vec<FillReport> {
        let mut book = self.book.lock().expect("paper book poisoned");
        book.last_price = price;

        let crossed: Vec<String> = book
            .open
            .values()
            .filter(|order| match order.side {
                Side::Buy => price <= order.price.to_f64(),
                Side::Sell => price >= order.price.to_f64(),
            })
            .map(|order| order.client_order_id.clone())
            .collect();

        let mut reports = Vec::with_capacity(crossed.len());
        for id in crossed {
            let order = book.open.remove(&id).expect("crossed order vanished");
            let fill_price = order.price.to_f64();
            let size = order.size.to_f64();
            match order.side {
                Side::Buy => {
                    book.cash -= fill_price * size;
                    book.position += size;
                    book.cost_basis += fill_price * size;
                }
                Side::Sell => {
                    let avg_entry = if book.position > 0.0 {
                        book.cost_basis / book.position
                    } else {
                        fill_price
                    };
                    book.cash += fill_price * size;
                    book.realized_pnl += (fill_price - avg_entry) * size;
                    book.cost_basis -= avg_entry * size;
                    book.position -= size;
                }
            }
            let report = FillReport {
                client_order_id: order.client_order_id,
                price: order.price,
                size: order.size,
                timestamp: Utc::now(),
            };
            debug!(
                client_order_id = %report.client_order_id,
                price = fill_price,
                "paper fill"
            );
            book.fills.insert(report.client_order_id.clone(), report.clone());
            reports.push(report);
        }

        let value = book.cash + book.position * price;
        if value > book.peak_value {
            book.peak_value = value;
        }
        reports
    }

    /// Current account state of the paper book
    pub fn account_snapshot(&self) -> AccountSnapshot {
        let book = self.book.lock().expect("paper book poisoned");
        let entry_price = if book.position > 0.0 {
            book.cost_basis / book.position
        } else {
            0.0
        };
        let unrealized = if book.position > 0.0 {
            (book.last_price - entry_price) * book.position
        } else {
            0.0
        };
        AccountSnapshot {
            balance: book.cash,
            position_size: book.position,
            entry_price,
            account_value: book.cash + book.position * book.last_price,
            peak_value: book.peak_value,
            realized_pnl: book.realized_pnl,
            unrealized_pnl: unrealized,
        }
    }
}

#[async_trait]
impl ExecutionClient for PaperExchange {
    async fn submit(&self, order: OrderInstruction) -> Result<SubmitAck> {
        if !order.size.is_positive() || !order.price.is_positive() {
            return Ok(SubmitAck::Rejected {
                reason: "price and size must be positive".into(),
            });
        }
        let mut book = self.book.lock().expect("paper book poisoned");
        // Idempotent by client order id: a resubmit of a known order is a no-op
        if book.fills.contains_key(&order.client_order_id)
            || book.open.contains_key(&order.client_order_id)
        {
            return Ok(SubmitAck::Accepted);
        }
        book.open.insert(
            order.client_order_id.clone(),
            OpenOrder {
                client_order_id: order.client_order_id,
                side: order.side,
                price: order.price,
                size: order.size,
            },
        );
        Ok(SubmitAck::Accepted)
    }

    async fn cancel(&self, client_order_id: &str) -> Result<CancelAck> {
        let mut book = self.book.lock().expect("paper book poisoned");
        if book.open.remove(client_order_id).is_some() {
            Ok(CancelAck::Accepted)
        } else {
            Ok(CancelAck::NotFound)
        }
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let book = self.book.lock().expect("paper book poisoned");
        Ok(book.open.values().cloned().collect())
    }

    async fn lookup_fill(&self, client_order_id: &str) -> Result<Option<FillReport>> {
        let book = self.book.lock().expect("paper book poisoned");
        Ok(book.fills.get(client_order_id).cloned())
    }

    async fn market_close(&self, size: Money) -> Result<()> {
        let mut book = self.book.lock().expect("paper book poisoned");
        let size = size.to_f64().min(book.position);
        if size <= 0.0 {
            return Ok(());
        }
        let price = book.last_price;
        let avg_entry = if book.position > 0.0 {
            book.cost_basis / book.position
        } else {
            price
        };
        book.cash += price * size;
        book.realized_pnl += (price - avg_entry) * size;
        book.cost_basis -= avg_entry * size;
        book.position -= size;
        debug!(size, price, "paper market close");
        Ok(())
    }
}
