//! External collaborator seams
//!
//! The account core talks to three outside systems: the chain node (for
//! spendable balances and order existence), the order DB (terminal order
//! history) and the store sink (the append-only intent log read by the
//! matching engine). Each is a trait object so tests can substitute
//! in-memory fakes.

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;
use types::prelude::*;

use crate::events::QueueEvent;

/// Chain node transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("connection to the chain node was lost")]
    ConnectionBroken,

    #[error("chain node request failed: {0}")]
    Unexpected(String),
}

impl From<NodeError> for MatcherError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::ConnectionBroken => MatcherError::NodeConnectionBroken,
            NodeError::Unexpected(msg) => MatcherError::UnexpectedError(msg),
        }
    }
}

/// Read access to the chain node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Spendable balances for a subset of assets. Missing assets are
    /// reported as zero.
    async fn spendable_balances(
        &self,
        address: Address,
        assets: BTreeSet<Asset>,
    ) -> Result<BalanceMap, NodeError>;

    /// Spendable balances across all assets the address holds.
    async fn all_spendable_balances(&self, address: Address) -> Result<BalanceMap, NodeError>;

    /// Whether an order with this id has already been seen on-chain.
    async fn has_order(&self, id: OrderId) -> Result<bool, NodeError>;
}

/// Key/value persistence for terminal order state.
///
/// Only finalized orders are written here; active orders live solely in
/// their account actor.
pub trait OrderDb: Send + Sync {
    fn save_order(&self, order: &Order);

    fn save_order_info(&self, owner: Address, info: &OrderInfo);

    /// Terminal status of an order, `NotFound` when unknown.
    fn status(&self, id: OrderId) -> OrderStatus;

    fn contains_info(&self, id: OrderId) -> bool;

    /// Finalized orders of an owner, optionally filtered by pair,
    /// excluding ids the caller already knows as active.
    fn load_remaining_orders(
        &self,
        owner: Address,
        pair: Option<&AssetPair>,
        known_active: &BTreeSet<OrderId>,
    ) -> Vec<OrderInfo>;
}

/// Store sink transport failure (transient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store is temporarily unavailable: {0}")]
    Unavailable(String),
}

/// Append-only intent log consumed by the matching engine.
#[async_trait]
pub trait StoreSink: Send + Sync {
    /// Persist an event. `Ok(Some(offset))` means persisted,
    /// `Ok(None)` means persistence is disabled, `Err` is transient.
    async fn store(&self, event: QueueEvent) -> Result<Option<u64>, StoreError>;
}
