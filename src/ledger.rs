//! Order ledger
//!
//! Single owner of order/level state. Maps each level of the current grid
//! generation to at most one managed order, and retains orders from
//! superseded generations until their terminal acknowledgement arrives so a
//! late fill or cancel-ack can never corrupt the current grid.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Money, Side};

/// Deterministic client order id: `grid-{generation}-{level_index}`.
///
/// Idempotent resubmission and reconciliation both key off this format.
pub fn client_order_id(generation: u64, level_index: u32) -> String {
    format!("grid-{generation}-{level_index}")
}

/// Parse a client order id produced by [`client_order_id`]
pub fn parse_client_order_id(id: &str) -> Option<(u64, u32)> {
    let rest = id.strip_prefix("grid-")?;
    let (generation, level) = rest.split_once('-')?;
    Some((generation.parse().ok()?, level.parse().ok()?))
}

/// Lifecycle of a managed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Planned, not yet submitted
    Pending,
    /// Submit call in flight (or unresolved after a call timeout)
    Submitting,
    /// Acknowledged by the exchange
    Live,
    Filled,
    Cancelled,
    Rejected,
}

/// One order owned by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedOrder {
    pub client_order_id: String,
    pub generation: u64,
    pub level_index: u32,
    pub side: Side,
    pub price: Money,
    pub size: Money,
    pub state: OrderState,
    /// Submit attempts consumed (for reject retry bookkeeping)
    pub attempts: u32,
}

impl ManagedOrder {
    /// Non-terminal states
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            OrderState::Pending | OrderState::Submitting | OrderState::Live
        )
    }
}

/// A fill fact emitted to the coordinator
#[derive(Debug, Clone)]
pub struct LevelFill {
    pub generation: u64,
    pub level_index: u32,
    pub side: Side,
    pub price: Money,
    pub size: Money,
    /// False for fills settling against a superseded generation; those are
    /// bookkept but never produce replacement orders.
    pub current_generation: bool,
}

/// In-memory order/level state, exclusively owned by the coordinator
#[derive(Debug, Default)]
pub struct OrderLedger {
    generation: u64,
    /// Current-generation orders keyed by level index. The key is what
    /// enforces "at most one live order per (generation, level)".
    current: BTreeMap<u32, ManagedOrder>,
    /// Superseded-generation orders awaiting terminal settlement
    retired: HashMap<String, ManagedOrder>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new generation: retire every open current order and create
    /// Pending entries for the new plan. Returns the new generation number.
    pub fn begin_generation(
        &mut self,
        orders: impl IntoIterator<Item = (u32, Side, Money, Money)>,
    ) -> u64 {
        for (_, order) in std::mem::take(&mut self.current) {
            // Cancelled orders that reached the exchange are retained too: a
            // fill can race the cancel and its ack must still settle here.
            let may_settle_late =
                order.is_open() || (order.state == OrderState::Cancelled && order.attempts > 0);
            if may_settle_late {
                self.retired.insert(order.client_order_id.clone(), order);
            }
        }
        self.generation += 1;
        for (level_index, side, price, size) in orders {
            let order = ManagedOrder {
                client_order_id: client_order_id(self.generation, level_index),
                generation: self.generation,
                level_index,
                side,
                price,
                size,
                state: OrderState::Pending,
                attempts: 0,
            };
            self.current.insert(level_index, order);
        }
        self.generation
    }

    /// Add a replacement order at `level_index` in the current generation.
    /// Returns None if the level already carries a live order (invariant 1)
    /// or was occupied by a terminal order that has not been replanned away.
    pub fn insert_replacement(
        &mut self,
        level_index: u32,
        side: Side,
        price: Money,
        size: Money,
    ) -> Option<&ManagedOrder> {
        match self.current.get(&level_index) {
            Some(existing) if existing.is_open() => return None,
            _ => {}
        }
        let order = ManagedOrder {
            client_order_id: client_order_id(self.generation, level_index),
            generation: self.generation,
            level_index,
            side,
            price,
            size,
            state: OrderState::Pending,
            attempts: 0,
        };
        self.current.insert(level_index, order);
        self.current.get(&level_index)
    }

    /// Adopt an order discovered on the exchange during reconciliation
    pub fn adopt(&mut self, order: ManagedOrder) {
        debug_assert_eq!(order.generation, self.generation);
        self.current.insert(order.level_index, order);
    }

    pub fn get(&self, level_index: u32) -> Option<&ManagedOrder> {
        self.current.get(&level_index)
    }

    pub fn get_by_id(&self, client_order_id: &str) -> Option<&ManagedOrder> {
        match parse_client_order_id(client_order_id) {
            Some((generation, level)) if generation == self.generation => {
                self.current.get(&level)
            }
            _ => self.retired.get(client_order_id),
        }
    }

    /// Orders of the current generation that are not yet terminal
    pub fn open_orders(&self) -> impl Iterator<Item = &ManagedOrder> {
        self.current.values().filter(|o| o.is_open())
    }

    pub fn open_count(&self) -> usize {
        self.current.values().filter(|o| o.is_open()).count()
    }

    pub fn mark_submitting(&mut self, level_index: u32) {
        if let Some(order) = self.current.get_mut(&level_index) {
            order.state = OrderState::Submitting;
            order.attempts += 1;
        }
    }

    pub fn mark_live(&mut self, level_index: u32) {
        if let Some(order) = self.current.get_mut(&level_index) {
            order.state = OrderState::Live;
        }
    }

    /// Put a rejected order back to Pending for another submit attempt
    pub fn mark_pending_retry(&mut self, level_index: u32) {
        if let Some(order) = self.current.get_mut(&level_index) {
            order.state = OrderState::Pending;
        }
    }

    /// Give up on a level after exhausting submit attempts
    pub fn mark_failed(&mut self, level_index: u32) {
        if let Some(order) = self.current.get_mut(&level_index) {
            order.state = OrderState::Cancelled;
        }
    }

    /// Apply a fill acknowledgement. Returns the fill fact, or None for an
    /// order the ledger has never heard of (unresolved drift).
    pub fn apply_fill(&mut self, id: &str, price: Money, size: Money) -> Option<LevelFill> {
        if let Some((generation, level)) = parse_client_order_id(id) {
            if generation == self.generation {
                if let Some(order) = self.current.get_mut(&level) {
                    order.state = OrderState::Filled;
                    return Some(LevelFill {
                        generation,
                        level_index: level,
                        side: order.side,
                        price,
                        size,
                        current_generation: true,
                    });
                }
            }
        }
        if let Some(order) = self.retired.remove(id) {
            // Final settlement for a superseded generation
            return Some(LevelFill {
                generation: order.generation,
                level_index: order.level_index,
                side: order.side,
                price,
                size,
                current_generation: false,
            });
        }
        warn!(client_order_id = id, "fill for unknown order, needs reconciliation");
        None
    }

    /// Apply a cancel acknowledgement; returns false for unknown orders
    pub fn apply_cancelled(&mut self, id: &str) -> bool {
        if let Some((generation, level)) = parse_client_order_id(id) {
            if generation == self.generation {
                if let Some(order) = self.current.get_mut(&level) {
                    order.state = OrderState::Cancelled;
                    return true;
                }
            }
        }
        self.retired.remove(id).is_some()
    }

    /// Apply a reject; returns the attempts consumed so far, or None for an
    /// unknown order.
    pub fn apply_rejected(&mut self, id: &str) -> Option<(u32, u32)> {
        let (generation, level) = parse_client_order_id(id)?;
        if generation != self.generation {
            if let Some(order) = self.retired.get_mut(id) {
                order.state = OrderState::Rejected;
            }
            return None;
        }
        let order = self.current.get_mut(&level)?;
        order.state = OrderState::Rejected;
        Some((level, order.attempts))
    }

    /// Transition every Live/Submitting order to Cancelled and return the
    /// ids whose exchange-side cancel must be requested. Pending orders are
    /// cancelled locally without an exchange call. Idempotent: a second
    /// invocation finds nothing open and returns an empty list.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let mut to_cancel = Vec::new();
        for order in self.current.values_mut() {
            match order.state {
                OrderState::Live | OrderState::Submitting => {
                    to_cancel.push(order.client_order_id.clone());
                    order.state = OrderState::Cancelled;
                }
                OrderState::Pending => {
                    order.state = OrderState::Cancelled;
                }
                _ => {}
            }
        }
        for order in self.retired.values_mut() {
            if matches!(order.state, OrderState::Live | OrderState::Submitting) {
                to_cancel.push(order.client_order_id.clone());
                order.state = OrderState::Cancelled;
            }
        }
        to_cancel
    }

    /// Current-generation entries, for reconciliation diffing
    pub fn entries(&self) -> impl Iterator<Item = &ManagedOrder> {
        self.current.values()
    }

    /// Ids the exchange may still know about: every Submitting or Live order
    /// across the current and retired sets.
    pub fn unresolved_ids(&self) -> Vec<String> {
        self.current
            .values()
            .chain(self.retired.values())
            .filter(|o| matches!(o.state, OrderState::Submitting | OrderState::Live))
            .map(|o| o.client_order_id.clone())
            .collect()
    }

    /// Drop retired orders that reached a terminal state
    pub fn prune_retired(&mut self) {
        self.retired.retain(|_, o| o.is_open());
    }
}
