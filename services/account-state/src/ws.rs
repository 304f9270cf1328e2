//! Websocket push state for one account
//!
//! Subscribers receive exactly one snapshot (full balances plus all
//! active orders) and afterwards periodic diffs carrying only the assets
//! and orders that changed since the previous flush.
//!
//! Flow: subscribe → receive snapshot → receive diffs.
//!
//! Mutations stage their effects here; the actor's diff scheduler drains
//! the staged state on each tick. Whether an order change is sent with
//! full order info or as a delta depends on whether subscribers have
//! already seen the order (via a snapshot or an earlier diff):
//!
//! | Transition                                   | Payload     |
//! |----------------------------------------------|-------------|
//! | First `Accepted`/`PartiallyFilled` ever seen | full info   |
//! | Subsequent `PartiallyFilled`                 | fill delta  |
//! | First-time `Filled` (never seen before)      | full info   |
//! | `Cancelled`                                  | status only |
//!
//! Terminal orders leave the tracking set, keeping it bounded by the
//! number of live orders.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use types::prelude::*;

use rust_decimal::Decimal;

/// Channel end a subscriber listens on.
pub type WsSubscriber = mpsc::UnboundedSender<WsMessage>;

/// Balance pair pushed per asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WsBalanceEntry {
    pub tradable: Decimal,
    pub reserved: Decimal,
}

/// Order change pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOrderUpdate {
    /// Full order info, sent the first time subscribers see the order.
    Full {
        order_id: OrderId,
        pair: AssetPair,
        side: Side,
        price: Price,
        amount: Quantity,
        fee_asset: Asset,
        is_market: bool,
        timestamp: i64,
        status: OrderStatus,
    },
    /// Filling progress only.
    Fill {
        order_id: OrderId,
        status: OrderStatus,
    },
    /// Status transition only (cancellations).
    Status {
        order_id: OrderId,
        status: OrderStatus,
    },
}

impl WsOrderUpdate {
    pub fn full(ao: &AcceptedOrder) -> Self {
        WsOrderUpdate::Full {
            order_id: ao.order.id,
            pair: ao.order.pair,
            side: ao.order.side,
            price: ao.order.price,
            amount: ao.order.amount,
            fee_asset: ao.order.fee_asset,
            is_market: ao.is_market,
            timestamp: ao.order.timestamp,
            status: ao.status(),
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            WsOrderUpdate::Full { order_id, .. }
            | WsOrderUpdate::Fill { order_id, .. }
            | WsOrderUpdate::Status { order_id, .. } => *order_id,
        }
    }

    fn status(&self) -> &OrderStatus {
        match self {
            WsOrderUpdate::Full { status, .. }
            | WsOrderUpdate::Fill { status, .. }
            | WsOrderUpdate::Status { status, .. } => status,
        }
    }

    /// Fold a newer update into an already-staged one. Full payloads
    /// stay full (with the newer status); otherwise the newer update
    /// wins.
    fn merged_into(self, newer_status: OrderStatus, fallback: WsOrderUpdate) -> WsOrderUpdate {
        match self {
            WsOrderUpdate::Full {
                order_id,
                pair,
                side,
                price,
                amount,
                fee_asset,
                is_market,
                timestamp,
                ..
            } => WsOrderUpdate::Full {
                order_id,
                pair,
                side,
                price,
                amount,
                fee_asset,
                is_market,
                timestamp,
                status: newer_status,
            },
            _ => fallback,
        }
    }
}

/// Message pushed to websocket subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Snapshot {
        balances: BTreeMap<Asset, WsBalanceEntry>,
        orders: Vec<WsOrderUpdate>,
    },
    Diff {
        balances: BTreeMap<Asset, WsBalanceEntry>,
        orders: Vec<WsOrderUpdate>,
    },
}

/// Mutable websocket state owned by one account actor.
#[derive(Default)]
pub struct WsMutableState {
    /// Subscribers awaiting their initial snapshot.
    pub pending: Vec<WsSubscriber>,
    /// Subscribers that received the snapshot and now get diffs.
    pub active: Vec<WsSubscriber>,
    /// Assets whose reserved/tradable values changed since last flush.
    changed_assets: BTreeSet<Asset>,
    /// Order changes staged for the next flush.
    order_updates: BTreeMap<OrderId, WsOrderUpdate>,
    /// Orders subscribers already know about.
    tracked_orders: BTreeSet<OrderId>,
    /// Whether a diff tick is currently scheduled.
    pub scheduler_running: bool,
    /// Whether a balance snapshot request is already on its way.
    pub snapshot_in_flight: bool,
}

impl WsMutableState {
    pub fn has_subscribers(&self) -> bool {
        !self.pending.is_empty() || !self.active.is_empty()
    }

    pub fn has_staged_changes(&self) -> bool {
        !self.changed_assets.is_empty() || !self.order_updates.is_empty()
    }

    /// Mark assets whose balances must be refreshed on the next flush.
    pub fn stage_assets<'a>(&mut self, assets: impl IntoIterator<Item = &'a Asset>) {
        self.changed_assets.extend(assets.into_iter().copied());
    }

    /// Stage an order change, applying the full-vs-delta table.
    pub fn stage_order(&mut self, ao: &AcceptedOrder) {
        let id = ao.order.id;
        let status = ao.status();
        let update = if self.tracked_orders.insert(id) {
            WsOrderUpdate::full(ao)
        } else {
            WsOrderUpdate::Fill {
                order_id: id,
                status: status.clone(),
            }
        };
        self.merge_update(id, update);
        if status.is_terminal() {
            self.tracked_orders.remove(&id);
        }
    }

    /// Stage a status-only transition (cancellations).
    pub fn stage_status(&mut self, id: OrderId, status: OrderStatus) {
        let terminal = status.is_terminal();
        self.merge_update(
            id,
            WsOrderUpdate::Status {
                order_id: id,
                status,
            },
        );
        if terminal {
            self.tracked_orders.remove(&id);
        } else {
            self.tracked_orders.insert(id);
        }
    }

    /// Record orders delivered through a snapshot: subscribers know them
    /// now, so later changes arrive as deltas.
    pub fn mark_tracked(&mut self, ids: impl IntoIterator<Item = OrderId>) {
        self.tracked_orders.extend(ids);
    }

    fn merge_update(&mut self, id: OrderId, update: WsOrderUpdate) {
        let merged = match self.order_updates.remove(&id) {
            Some(existing) => existing.merged_into(update.status().clone(), update),
            None => update,
        };
        self.order_updates.insert(id, merged);
    }

    /// Drain everything staged for one flush.
    pub fn take_staged(&mut self) -> (BTreeSet<Asset>, Vec<WsOrderUpdate>) {
        let assets = std::mem::take(&mut self.changed_assets);
        let updates = std::mem::take(&mut self.order_updates);
        (assets, updates.into_values().collect())
    }

    /// Put a flush back after a failed balance fetch so the next tick
    /// retries it.
    pub fn restage(&mut self, assets: BTreeSet<Asset>, updates: Vec<WsOrderUpdate>) {
        self.changed_assets.extend(assets);
        for update in updates {
            self.order_updates.entry(update.order_id()).or_insert(update);
        }
    }

    /// Forget everything staged and tracked; used when the last
    /// subscriber is gone (the next snapshot restates the world).
    pub fn reset_window(&mut self) {
        self.changed_assets.clear();
        self.order_updates.clear();
        self.tracked_orders.clear();
    }

    /// Deliver the snapshot to every pending subscriber and promote the
    /// live ones to active.
    pub fn promote_pending(&mut self, snapshot: &WsMessage) {
        for subscriber in self.pending.drain(..) {
            if subscriber.send(snapshot.clone()).is_ok() {
                self.active.push(subscriber);
            }
        }
    }

    /// Deliver a diff, dropping subscribers whose channel has closed.
    pub fn broadcast_diff(&mut self, diff: &WsMessage) {
        self.active
            .retain(|subscriber| subscriber.send(diff.clone()).is_ok());
    }

    /// Drop closed subscriber channels.
    pub fn sweep_closed(&mut self) {
        self.pending.retain(|s| !s.is_closed());
        self.active.retain(|s| !s.is_closed());
    }
}
