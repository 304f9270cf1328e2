//! Error taxonomy surfaced to matcher clients

use crate::balance::BalanceMap;
use crate::ids::OrderId;
use thiserror::Error;

/// Client-facing error taxonomy.
///
/// Placement and cancellation rejections are deterministic; node and
/// store failures are transient and reported as such.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatcherError {
    #[error("order {0} is already being processed")]
    OrderDuplicate(OrderId),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("order {0} is already cancelled")]
    OrderCanceled(OrderId),

    #[error("order {0} is already filled")]
    OrderFull(OrderId),

    #[error("active order limit of {limit} reached")]
    ActiveOrdersLimitReached { limit: usize },

    #[error("market order {0} cannot be cancelled manually")]
    MarketOrderCancel(OrderId),

    #[error("balance not enough: required {required:?}, available {available:?}")]
    BalanceNotEnough {
        required: BalanceMap,
        available: BalanceMap,
    },

    #[error("connection to the chain node is broken")]
    NodeConnectionBroken,

    #[error("event persistence is disabled")]
    FeatureDisabled,

    #[error("can not persist the event")]
    CanNotPersistEvent,

    #[error("unexpected error: {0}")]
    UnexpectedError(String),
}
