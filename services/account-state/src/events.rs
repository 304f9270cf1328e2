//! Event structures exchanged with the matching engine and the store
//!
//! Inbound: [`MatcherEvent`] — what the matching engine publishes after
//! consuming the intent log. Outbound: [`QueueEvent`] — the intents this
//! service appends to the store sink.

use serde::{Deserialize, Serialize};
use types::prelude::*;

use rust_decimal::Decimal;

/// Events published by the matching engine, routed per account by the
/// sender address of the orders they carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatcherEvent {
    /// An order entered (or, after a partial execution, re-entered) the
    /// book with the carried remaining state.
    OrderAdded { order: AcceptedOrder },

    /// Two orders traded; both sides carry their post-execution state.
    OrderExecuted {
        submitted: AcceptedOrder,
        counter: AcceptedOrder,
        timestamp: i64,
    },

    /// An order left the book without (fully) trading.
    OrderCanceled {
        order: AcceptedOrder,
        is_system: bool,
    },
}

impl MatcherEvent {
    /// Owners whose account state this event touches, deduplicated.
    pub fn owners(&self) -> Vec<Address> {
        match self {
            MatcherEvent::OrderAdded { order } => vec![order.sender()],
            MatcherEvent::OrderExecuted {
                submitted, counter, ..
            } => {
                let mut owners = vec![submitted.sender()];
                if counter.sender() != submitted.sender() {
                    owners.push(counter.sender());
                }
                owners
            }
            MatcherEvent::OrderCanceled { order, .. } => vec![order.sender()],
        }
    }
}

/// Why a cancellation intent was issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    /// The owner asked for it.
    Requested,
    /// The order outlived its expiration timestamp.
    Expired,
    /// The owner's spendable balance no longer covers the reservation.
    NotEnoughFunds {
        asset: Asset,
        insufficient_amount: Decimal,
    },
}

/// Intents appended to the store sink for the matching engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueEvent {
    Placed(AcceptedOrder),
    PlacedMarket(AcceptedOrder),
    Canceled {
        pair: AssetPair,
        order_id: OrderId,
        reason: CancelReason,
    },
}

impl QueueEvent {
    /// Placement intent with the market/limit split encoded in the
    /// variant, as the engine expects.
    pub fn placed(order: AcceptedOrder) -> Self {
        if order.is_market {
            QueueEvent::PlacedMarket(order)
        } else {
            QueueEvent::Placed(order)
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            QueueEvent::Placed(order) | QueueEvent::PlacedMarket(order) => order.id(),
            QueueEvent::Canceled { order_id, .. } => *order_id,
        }
    }
}
