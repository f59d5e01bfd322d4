//! Grid Strategy & Risk Coordination Engine
//!
//! Maintains a ladder of resting limit orders around a reference price,
//! harvests the spread by replacing each fill with an opposite-side order
//! one level away, and coordinates planning, order-state tracking, risk
//! enforcement, rebalancing, and exchange reconciliation behind a single
//! serialized event loop.

pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod planner;
pub mod rebalance;
pub mod reconcile;
pub mod risk;
pub mod types;

pub use config::StrategyConfig;
pub use engine::{Engine, EngineEvent, EngineState, OrderUpdateKind};
pub use types::*;
