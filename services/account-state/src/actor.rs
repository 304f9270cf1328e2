//! Per-account order lifecycle actor
//!
//! One actor instance owns everything a trading address has at the
//! matcher: its open orders, the volume those orders reserve, the
//! placement queue, pending client commands, expiry timers and the
//! websocket push state. The actor is a single cooperative task; every
//! suspension (validation, balance asks, event persistence, timers)
//! re-enters through the mailbox as a self-sent message, so state is
//! only ever touched between messages.
//!
//! The placement pipeline admits one in-flight validation per account:
//!
//! ```text
//!    Queued ── head? ──► Validating ──► (passed) ──► Stored ──► Accepted
//!                                  └──► (failed) ──► Rejected
//! ```

use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use types::prelude::*;

use crate::balances::BalanceOracleHandle;
use crate::config::AccountServiceConfig;
use crate::events::{CancelReason, MatcherEvent, QueueEvent};
use crate::gateways::{NodeClient, NodeError, OrderDb, StoreSink};
use crate::uncovered::select_uncovered;
use crate::validation::validate_placement;
use crate::ws::{WsBalanceEntry, WsMessage, WsMutableState, WsOrderUpdate, WsSubscriber};

/// Final answer to a placement request.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    Accepted(OrderId),
    Rejected(MatcherError),
    NodeUnavailable(MatcherError),
    CanNotPersist(MatcherError),
}

/// Final answer to a cancellation request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Canceled(OrderId),
    Rejected(MatcherError),
}

/// Per-order results of a batch cancellation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchCancelOutcome {
    pub results: BTreeMap<OrderId, CancelOutcome>,
}

/// External collaborators an account actor works against.
#[derive(Clone)]
pub struct AccountDeps {
    pub node: Arc<dyn NodeClient>,
    pub oracle: BalanceOracleHandle,
    pub order_db: Arc<dyn OrderDb>,
    pub store: Arc<dyn StoreSink>,
}

/// A client command whose answer is deferred until the matching engine
/// confirms it.
enum PendingCommand {
    Place {
        order: Order,
        is_market: bool,
        reply: oneshot::Sender<PlacementOutcome>,
    },
    Cancel {
        reply: oneshot::Sender<CancelOutcome>,
    },
}

enum AccountMessage {
    // Client commands
    PlaceOrder {
        order: Order,
        is_market: bool,
        reply: oneshot::Sender<PlacementOutcome>,
    },
    CancelOrder {
        order_id: OrderId,
        reply: oneshot::Sender<CancelOutcome>,
    },
    CancelAllOrders {
        pair: Option<AssetPair>,
        reply: oneshot::Sender<BatchCancelOutcome>,
    },
    CancelUncovered {
        new_balance: BalanceSnapshot,
    },
    // Queries
    GetReservedBalance {
        reply: oneshot::Sender<BalanceMap>,
    },
    GetTradableBalance {
        assets: BTreeSet<Asset>,
        reply: oneshot::Sender<Result<BalanceMap, MatcherError>>,
    },
    GetOrderStatus {
        order_id: OrderId,
        reply: oneshot::Sender<OrderStatus>,
    },
    GetOrdersStatuses {
        pair: Option<AssetPair>,
        only_active: bool,
        reply: oneshot::Sender<Vec<OrderInfo>>,
    },
    // Notifications
    WsSubscribe {
        subscriber: WsSubscriber,
    },
    StartSchedules,
    Matcher(MatcherEvent),
    // Folded-back suspension results
    ValidationPassed {
        order: AcceptedOrder,
    },
    ValidationFailed {
        order_id: OrderId,
        error: MatcherError,
    },
    StoreFailed {
        order_id: OrderId,
        error: MatcherError,
    },
    WsSnapshot {
        result: Result<BalanceMap, NodeError>,
    },
    WsDiffFetched {
        assets: BTreeSet<Asset>,
        orders: Vec<WsOrderUpdate>,
        result: Result<BalanceMap, NodeError>,
    },
    WsDiffTick,
    ExpireOrder {
        order_id: OrderId,
    },
}

/// Cloneable mailbox handle to one account actor.
#[derive(Clone)]
pub struct AccountHandle {
    tx: mpsc::UnboundedSender<AccountMessage>,
}

impl AccountHandle {
    pub async fn place_order(&self, order: Order, is_market: bool) -> PlacementOutcome {
        let (reply, rx) = oneshot::channel();
        let stopped = MatcherError::UnexpectedError("account actor stopped".into());
        if self
            .tx
            .send(AccountMessage::PlaceOrder {
                order,
                is_market,
                reply,
            })
            .is_err()
        {
            return PlacementOutcome::Rejected(stopped);
        }
        rx.await
            .unwrap_or(PlacementOutcome::Rejected(MatcherError::UnexpectedError(
                "account actor stopped".into(),
            )))
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> CancelOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AccountMessage::CancelOrder { order_id, reply })
            .is_err()
        {
            return CancelOutcome::Rejected(MatcherError::UnexpectedError(
                "account actor stopped".into(),
            ));
        }
        rx.await.unwrap_or(CancelOutcome::Rejected(
            MatcherError::UnexpectedError("account actor stopped".into()),
        ))
    }

    pub async fn cancel_all(&self, pair: Option<AssetPair>) -> BatchCancelOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AccountMessage::CancelAllOrders { pair, reply })
            .is_err()
        {
            return BatchCancelOutcome::default();
        }
        rx.await.unwrap_or_default()
    }

    /// React to an external balance change: cancel whatever the new
    /// balance no longer covers. Fire-and-forget.
    pub fn cancel_uncovered(&self, new_balance: BalanceSnapshot) {
        let _ = self
            .tx
            .send(AccountMessage::CancelUncovered { new_balance });
    }

    pub async fn reserved_balance(&self) -> BalanceMap {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AccountMessage::GetReservedBalance { reply })
            .is_err()
        {
            return BalanceMap::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn tradable_balance(
        &self,
        assets: BTreeSet<Asset>,
    ) -> Result<BalanceMap, MatcherError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AccountMessage::GetTradableBalance { assets, reply })
            .is_err()
        {
            return Err(MatcherError::UnexpectedError(
                "account actor stopped".into(),
            ));
        }
        rx.await.unwrap_or(Err(MatcherError::UnexpectedError(
            "account actor stopped".into(),
        )))
    }

    pub async fn order_status(&self, order_id: OrderId) -> OrderStatus {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AccountMessage::GetOrderStatus { order_id, reply })
            .is_err()
        {
            return OrderStatus::NotFound;
        }
        rx.await.unwrap_or(OrderStatus::NotFound)
    }

    pub async fn orders_statuses(
        &self,
        pair: Option<AssetPair>,
        only_active: bool,
    ) -> Vec<OrderInfo> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AccountMessage::GetOrdersStatuses {
                pair,
                only_active,
                reply,
            })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Register a websocket subscriber; it receives one snapshot and
    /// then periodic diffs.
    pub fn subscribe(&self, subscriber: WsSubscriber) {
        let _ = self.tx.send(AccountMessage::WsSubscribe { subscriber });
    }

    /// Enable expiry scheduling for current and future active orders.
    pub fn start_schedules(&self) {
        let _ = self.tx.send(AccountMessage::StartSchedules);
    }

    /// Feed a matching-engine event into the actor.
    pub fn matcher_event(&self, event: MatcherEvent) {
        let _ = self.tx.send(AccountMessage::Matcher(event));
    }
}

/// Current Unix time in milliseconds.
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

/// The per-account actor. Owns all state for one trading address.
pub struct AccountActor {
    owner: Address,
    config: AccountServiceConfig,
    deps: AccountDeps,
    /// Weak so helper tasks and timers cannot keep a stopped actor alive.
    self_tx: mpsc::WeakUnboundedSender<AccountMessage>,
    active_orders: BTreeMap<OrderId, AcceptedOrder>,
    /// Invariant: equals the pointwise sum of reservable balances over
    /// `active_orders`, zero entries absent. Going negative is fatal.
    open_volume: BalanceMap,
    placement_queue: VecDeque<OrderId>,
    pending_commands: BTreeMap<OrderId, PendingCommand>,
    expiry_timers: BTreeMap<OrderId, AbortHandle>,
    ws: WsMutableState,
    schedules_enabled: bool,
}

impl AccountActor {
    /// Spawn the actor task for an address and return its handle.
    pub fn spawn(
        owner: Address,
        config: AccountServiceConfig,
        deps: AccountDeps,
        schedules_enabled: bool,
    ) -> AccountHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = AccountActor {
            owner,
            config,
            deps,
            self_tx: tx.downgrade(),
            active_orders: BTreeMap::new(),
            open_volume: BalanceMap::new(),
            placement_queue: VecDeque::new(),
            pending_commands: BTreeMap::new(),
            expiry_timers: BTreeMap::new(),
            ws: WsMutableState::default(),
            schedules_enabled,
        };
        tokio::spawn(actor.run(rx));
        AccountHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AccountMessage>) {
        debug!(owner = %self.owner, "account actor started");
        while let Some(message) = rx.recv().await {
            self.handle(message);
        }
        for (_, timer) in std::mem::take(&mut self.expiry_timers) {
            timer.abort();
        }
        debug!(owner = %self.owner, "account actor stopped");
    }

    fn handle(&mut self, message: AccountMessage) {
        match message {
            AccountMessage::PlaceOrder {
                order,
                is_market,
                reply,
            } => self.place_order(order, is_market, reply),
            AccountMessage::CancelOrder { order_id, reply } => self.cancel_order(order_id, reply),
            AccountMessage::CancelAllOrders { pair, reply } => self.cancel_all(pair, reply),
            AccountMessage::CancelUncovered { new_balance } => self.cancel_uncovered(new_balance),
            AccountMessage::GetReservedBalance { reply } => {
                let _ = reply.send(self.open_volume.clone());
            }
            AccountMessage::GetTradableBalance { assets, reply } => {
                self.tradable_balance(assets, reply)
            }
            AccountMessage::GetOrderStatus { order_id, reply } => {
                let _ = reply.send(self.order_status(order_id));
            }
            AccountMessage::GetOrdersStatuses {
                pair,
                only_active,
                reply,
            } => self.orders_statuses(pair, only_active, reply),
            AccountMessage::WsSubscribe { subscriber } => self.ws_subscribe(subscriber),
            AccountMessage::StartSchedules => self.start_schedules(),
            AccountMessage::Matcher(event) => self.matcher_event(event),
            AccountMessage::ValidationPassed { order } => self.validation_passed(order),
            AccountMessage::ValidationFailed { order_id, error } => {
                self.validation_failed(order_id, error)
            }
            AccountMessage::StoreFailed { order_id, error } => self.store_failed(order_id, error),
            AccountMessage::WsSnapshot { result } => self.ws_snapshot(result),
            AccountMessage::WsDiffFetched {
                assets,
                orders,
                result,
            } => self.ws_diff_fetched(assets, orders, result),
            AccountMessage::WsDiffTick => self.ws_diff_tick(),
            AccountMessage::ExpireOrder { order_id } => self.expire_order(order_id),
        }
    }

    // ── Placement pipeline ──────────────────────────────────────────

    fn place_order(
        &mut self,
        order: Order,
        is_market: bool,
        reply: oneshot::Sender<PlacementOutcome>,
    ) {
        let id = order.id;
        if self.pending_commands.contains_key(&id) {
            let _ = reply.send(PlacementOutcome::Rejected(MatcherError::OrderDuplicate(id)));
            return;
        }
        if self.active_orders.len() + self.placement_queue.len() >= self.config.max_active_orders {
            let _ = reply.send(PlacementOutcome::Rejected(
                MatcherError::ActiveOrdersLimitReached {
                    limit: self.config.max_active_orders,
                },
            ));
            return;
        }

        debug!(owner = %self.owner, order_id = %id, is_market, "placement queued");
        self.pending_commands.insert(
            id,
            PendingCommand::Place {
                order: order.clone(),
                is_market,
                reply,
            },
        );
        self.placement_queue.push_back(id);
        // Only the queue head may validate; followers wait their turn.
        if self.placement_queue.len() == 1 {
            self.start_validation(order, is_market);
        }
    }

    /// Kick off the asynchronous validation of the queue head. The
    /// result re-enters the mailbox as ValidationPassed/Failed.
    fn start_validation(&self, order: Order, is_market: bool) {
        let id = order.id;
        let assets: BTreeSet<Asset> = [order.spend_asset(), order.fee_asset]
            .into_iter()
            .collect();
        let reserved = self.open_volume.restrict(&assets);
        let duplicate_active = self.active_orders.contains_key(&id);

        let node = Arc::clone(&self.deps.node);
        let order_db = Arc::clone(&self.deps.order_db);
        let oracle = self.deps.oracle.clone();
        let owner = self.owner;
        let ask_timeout = self.config.balance_request_timeout;
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            let balances = tokio::time::timeout(ask_timeout, oracle.get(owner, assets));
            let (on_chain, balances) = tokio::join!(node.has_order(id), balances);

            let message = match (on_chain, balances) {
                (_, Err(_)) => AccountMessage::ValidationFailed {
                    order_id: id,
                    error: MatcherError::UnexpectedError("balance request timed out".into()),
                },
                (_, Ok(Err(err))) => AccountMessage::ValidationFailed {
                    order_id: id,
                    error: err.into(),
                },
                (Err(err), _) => AccountMessage::ValidationFailed {
                    order_id: id,
                    error: err.into(),
                },
                (Ok(on_chain), Ok(Ok(spendable))) => {
                    let tradable = spendable.saturating_sub(&reserved);
                    let already_known =
                        duplicate_active || on_chain || order_db.contains_info(id);
                    match validate_placement(order, is_market, &tradable, already_known) {
                        Ok(accepted) => AccountMessage::ValidationPassed { order: accepted },
                        Err(error) => AccountMessage::ValidationFailed {
                            order_id: id,
                            error,
                        },
                    }
                }
            };
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(message);
            }
        });
    }

    fn validation_passed(&mut self, accepted: AcceptedOrder) {
        let id = accepted.id();
        assert_eq!(
            self.placement_queue.front().copied(),
            Some(id),
            "validation result for an order that is not the queue head"
        );
        assert!(
            matches!(
                self.pending_commands.get(&id),
                Some(PendingCommand::Place { .. })
            ),
            "placement queue head without a pending placement"
        );

        info!(owner = %self.owner, order_id = %id, "placement validated");
        let reservable = accepted.reservable_balance();
        self.open_volume.add(&reservable);
        self.active_orders.insert(id, accepted.clone());
        self.store_event(QueueEvent::placed(accepted));
        // The pending command stays; it resolves on OrderAdded (or a
        // store failure). The queue moves on.
        self.placement_queue.pop_front();
        self.advance_placement_queue();
    }

    fn validation_failed(&mut self, order_id: OrderId, error: MatcherError) {
        assert_eq!(
            self.placement_queue.front().copied(),
            Some(order_id),
            "validation result for an order that is not the queue head"
        );
        let Some(PendingCommand::Place { reply, .. }) = self.pending_commands.remove(&order_id)
        else {
            panic!("placement queue head {order_id} without a pending placement");
        };

        warn!(owner = %self.owner, %order_id, %error, "placement rejected");
        let outcome = match &error {
            MatcherError::NodeConnectionBroken => PlacementOutcome::NodeUnavailable(error.clone()),
            _ => PlacementOutcome::Rejected(error.clone()),
        };
        let _ = reply.send(outcome);
        self.placement_queue.pop_front();
        self.advance_placement_queue();
    }

    fn advance_placement_queue(&mut self) {
        let Some(next) = self.placement_queue.front().copied() else {
            return;
        };
        match self.pending_commands.get(&next) {
            Some(PendingCommand::Place {
                order, is_market, ..
            }) => {
                let (order, is_market) = (order.clone(), *is_market);
                self.start_validation(order, is_market);
            }
            _ => panic!("placement queue head {next} without a pending placement"),
        }
    }

    /// Persist an intent; failures re-enter the mailbox as StoreFailed.
    fn store_event(&self, event: QueueEvent) {
        let store = Arc::clone(&self.deps.store);
        let order_id = event.order_id();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let failure = match store.store(event).await {
                Ok(Some(_)) => None,
                Ok(None) => Some(MatcherError::FeatureDisabled),
                Err(_) => Some(MatcherError::CanNotPersistEvent),
            };
            if let Some(error) = failure {
                if let Some(tx) = self_tx.upgrade() {
                    let _ = tx.send(AccountMessage::StoreFailed { order_id, error });
                }
            }
        });
    }

    fn store_failed(&mut self, order_id: OrderId, error: MatcherError) {
        warn!(owner = %self.owner, %order_id, %error, "intent could not be persisted");
        // A placement still waiting in the queue has not attempted any
        // store yet; this failure belongs to an earlier incarnation of
        // the id and must not consume the queued command.
        if matches!(
            self.pending_commands.get(&order_id),
            Some(PendingCommand::Place { .. })
        ) && self.placement_queue.contains(&order_id)
        {
            return;
        }
        match self.pending_commands.remove(&order_id) {
            Some(PendingCommand::Place { reply, .. }) => {
                let _ = reply.send(PlacementOutcome::CanNotPersist(error));
            }
            Some(PendingCommand::Cancel { reply }) => {
                let _ = reply.send(CancelOutcome::Rejected(error));
            }
            // Expiry and coverage cancels have no client to answer.
            None => {}
        }
    }

    // ── Cancellation ────────────────────────────────────────────────

    fn cancel_order(&mut self, order_id: OrderId, reply: oneshot::Sender<CancelOutcome>) {
        match self.pending_commands.get(&order_id) {
            // The placement has not produced an order in the book yet.
            Some(PendingCommand::Place { .. }) => {
                let _ = reply.send(CancelOutcome::Rejected(MatcherError::OrderNotFound(
                    order_id,
                )));
                return;
            }
            Some(PendingCommand::Cancel { .. }) => {
                let _ = reply.send(CancelOutcome::Rejected(MatcherError::OrderCanceled(
                    order_id,
                )));
                return;
            }
            None => {}
        }

        match self.active_orders.get(&order_id) {
            Some(ao) if ao.is_market => {
                let _ = reply.send(CancelOutcome::Rejected(MatcherError::MarketOrderCancel(
                    order_id,
                )));
            }
            Some(ao) => {
                let pair = ao.order.pair;
                self.pending_commands
                    .insert(order_id, PendingCommand::Cancel { reply });
                self.store_event(QueueEvent::Canceled {
                    pair,
                    order_id,
                    reason: CancelReason::Requested,
                });
            }
            None => {
                let outcome = match self.deps.order_db.status(order_id) {
                    OrderStatus::Cancelled { .. } => {
                        CancelOutcome::Rejected(MatcherError::OrderCanceled(order_id))
                    }
                    OrderStatus::Filled { .. } => {
                        CancelOutcome::Rejected(MatcherError::OrderFull(order_id))
                    }
                    _ => CancelOutcome::Rejected(MatcherError::OrderNotFound(order_id)),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    fn cancel_all(&mut self, pair: Option<AssetPair>, reply: oneshot::Sender<BatchCancelOutcome>) {
        let targets: Vec<OrderId> = self
            .active_orders
            .values()
            .filter(|ao| !ao.is_market)
            .filter(|ao| pair.map_or(true, |p| ao.order.pair == p))
            .map(|ao| ao.id())
            .collect();

        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let handle = AccountHandle { tx };
        let deadline = self.config.batch_cancel_timeout;

        // Short-lived side task: issues the cancels through the mailbox
        // like any other client and gathers the replies.
        tokio::spawn(async move {
            let cancels = targets.into_iter().map(|order_id| {
                let handle = handle.clone();
                async move {
                    let outcome =
                        match tokio::time::timeout(deadline, handle.cancel_order(order_id)).await {
                            Ok(outcome) => outcome,
                            Err(_) => CancelOutcome::Rejected(MatcherError::UnexpectedError(
                                "batch cancel timed out".into(),
                            )),
                        };
                    (order_id, outcome)
                }
            });
            let results = join_all(cancels).await.into_iter().collect();
            let _ = reply.send(BatchCancelOutcome { results });
        });
    }

    fn cancel_uncovered(&mut self, new_balance: BalanceSnapshot) {
        let skip: BTreeSet<OrderId> = self
            .pending_commands
            .iter()
            .filter(|(_, command)| matches!(command, PendingCommand::Cancel { .. }))
            .map(|(id, _)| *id)
            .collect();

        for entry in select_uncovered(self.active_orders.values(), &new_balance, &skip) {
            info!(
                owner = %self.owner,
                order_id = %entry.order_id,
                asset = %entry.asset,
                insufficient = %entry.insufficient_amount,
                "balance no longer covers order, cancelling"
            );
            self.store_event(QueueEvent::Canceled {
                pair: entry.pair,
                order_id: entry.order_id,
                reason: CancelReason::NotEnoughFunds {
                    asset: entry.asset,
                    insufficient_amount: entry.insufficient_amount,
                },
            });
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    fn tradable_balance(
        &self,
        assets: BTreeSet<Asset>,
        reply: oneshot::Sender<Result<BalanceMap, MatcherError>>,
    ) {
        // Reserved volume is read now, under the actor's linearization;
        // only the spendable side is fetched asynchronously.
        let reserved = self.open_volume.restrict(&assets);
        let oracle = self.deps.oracle.clone();
        let owner = self.owner;
        let ask_timeout = self.config.balance_request_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(ask_timeout, oracle.get(owner, assets)).await {
                Ok(Ok(spendable)) => Ok(spendable.saturating_sub(&reserved)),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Err(MatcherError::UnexpectedError(
                    "balance request timed out".into(),
                )),
            };
            let _ = reply.send(result);
        });
    }

    fn order_status(&self, order_id: OrderId) -> OrderStatus {
        match self.active_orders.get(&order_id) {
            Some(ao) => ao.status(),
            None => self.deps.order_db.status(order_id),
        }
    }

    fn orders_statuses(
        &self,
        pair: Option<AssetPair>,
        only_active: bool,
        reply: oneshot::Sender<Vec<OrderInfo>>,
    ) {
        let mut infos: Vec<OrderInfo> = self
            .active_orders
            .values()
            .filter(|ao| pair.map_or(true, |p| ao.order.pair == p))
            .map(|ao| OrderInfo::from_accepted(ao, ao.status()))
            .collect();
        if !only_active {
            let known: BTreeSet<OrderId> = self.active_orders.keys().copied().collect();
            infos.extend(self.deps.order_db.load_remaining_orders(
                self.owner,
                pair.as_ref(),
                &known,
            ));
        }
        infos.sort_by_key(|info| (info.timestamp, info.id));
        let _ = reply.send(infos);
    }

    // ── Matching-engine events ──────────────────────────────────────

    fn matcher_event(&mut self, event: MatcherEvent) {
        match event {
            MatcherEvent::OrderAdded { order } => {
                if order.sender() != self.owner {
                    debug!(owner = %self.owner, order_id = %order.id(), "ignoring foreign order event");
                    return;
                }
                self.upsert_active(order);
            }
            MatcherEvent::OrderExecuted {
                submitted, counter, ..
            } => {
                for side in [submitted, counter] {
                    if side.sender() == self.owner {
                        self.handle_executed(side);
                    }
                }
            }
            MatcherEvent::OrderCanceled { order, is_system } => {
                if order.sender() != self.owner {
                    return;
                }
                self.handle_order_canceled(order, is_system);
            }
        }
    }

    /// Insert or refresh an active order and move the reserved volume by
    /// the delta against its previous reservation.
    fn upsert_active(&mut self, ao: AcceptedOrder) {
        let id = ao.id();
        self.deps.order_db.save_order(&ao.order);

        let prev_reservable = self
            .active_orders
            .get(&id)
            .map(|prev| prev.reservable_balance())
            .unwrap_or_default();
        let new_reservable = ao.reservable_balance();

        self.open_volume.add(&new_reservable);
        let updated = self.open_volume.checked_sub(&prev_reservable);
        self.open_volume = updated.unwrap_or_else(|| {
            panic!("reserved volume went negative for account {}", self.owner)
        });

        self.active_orders.insert(id, ao.clone());
        self.schedule_expiry(&ao);

        // Mirror reserve drops into the oracle so subscribers see the
        // spendable side fall before the trade settles on-chain.
        let dropped = prev_reservable.positive_diff(&new_reservable);
        if !dropped.is_empty() {
            self.deps.oracle.subtract(self.owner, dropped);
        }

        if self.ws.has_subscribers() {
            self.ws
                .stage_assets(prev_reservable.assets().chain(new_reservable.assets()));
            self.ws.stage_order(&ao);
        }

        if matches!(
            self.pending_commands.get(&id),
            Some(PendingCommand::Place { .. })
        ) && !self.placement_queue.contains(&id)
        {
            if let Some(PendingCommand::Place { reply, .. }) = self.pending_commands.remove(&id) {
                let _ = reply.send(PlacementOutcome::Accepted(id));
            }
        }
    }

    /// Fold one executed side: a positive remainder re-enters the book,
    /// an exhausted one terminates as filled.
    fn handle_executed(&mut self, remaining: AcceptedOrder) {
        if remaining.is_valid() {
            self.upsert_active(remaining);
            return;
        }

        let id = remaining.id();
        let prev_reservable = self
            .active_orders
            .get(&id)
            .map(|prev| prev.reservable_balance())
            .unwrap_or_default();
        if !prev_reservable.is_empty() {
            self.deps.oracle.subtract(self.owner, prev_reservable);
        }

        let status = remaining.status();
        if self.ws.has_subscribers() {
            self.ws.stage_order(&remaining);
        }
        self.handle_terminated(remaining, status);
    }

    fn handle_order_canceled(&mut self, ao: AcceptedOrder, is_system: bool) {
        let id = ao.id();
        // A queued re-placement of the same id has not reached the book;
        // this event is about the previous incarnation.
        let queued_placement = matches!(
            self.pending_commands.get(&id),
            Some(PendingCommand::Place { .. })
        ) && self.placement_queue.contains(&id);
        if !queued_placement {
            match self.pending_commands.remove(&id) {
                Some(PendingCommand::Cancel { reply }) => {
                    let _ = reply.send(CancelOutcome::Canceled(id));
                }
                Some(PendingCommand::Place { reply, .. }) => {
                    // The placement did reach the book before being swept
                    // out again; the placement itself succeeded.
                    let _ = reply.send(PlacementOutcome::Accepted(id));
                }
                None => {}
            }
        }

        if self.active_orders.contains_key(&id) {
            debug!(owner = %self.owner, order_id = %id, is_system, "order cancelled");
            let status = ao.cancelled_status();
            if self.ws.has_subscribers() {
                self.ws.stage_status(id, status.clone());
            }
            self.handle_terminated(ao, status);
        } else {
            debug!(owner = %self.owner, order_id = %id, "cancellation for an inactive order");
        }
    }

    /// Common terminal transition: persist, drop the timer, release the
    /// reservation.
    fn handle_terminated(&mut self, ao: AcceptedOrder, status: OrderStatus) {
        let id = ao.id();
        info!(owner = %self.owner, order_id = %id, ?status, "order terminated");
        self.deps.order_db.save_order(&ao.order);
        self.deps
            .order_db
            .save_order_info(self.owner, &OrderInfo::from_accepted(&ao, status));

        if let Some(timer) = self.expiry_timers.remove(&id) {
            timer.abort();
        }
        if let Some(prev) = self.active_orders.remove(&id) {
            let prev_reservable = prev.reservable_balance();
            let updated = self.open_volume.checked_sub(&prev_reservable);
            self.open_volume = updated.unwrap_or_else(|| {
                panic!("reserved volume went negative for account {}", self.owner)
            });
            if self.ws.has_subscribers() {
                self.ws.stage_assets(prev_reservable.assets());
            }
        }
    }

    // ── Expiry ──────────────────────────────────────────────────────

    fn schedule_expiry(&mut self, ao: &AcceptedOrder) {
        if !self.schedules_enabled {
            return;
        }
        let id = ao.id();
        if self.expiry_timers.contains_key(&id) {
            return;
        }
        let delay_ms = (ao.order.expiration - now_millis()).max(0) as u64;
        let self_tx = self.self_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(AccountMessage::ExpireOrder { order_id: id });
            }
        });
        self.expiry_timers.insert(id, task.abort_handle());
    }

    fn expire_order(&mut self, order_id: OrderId) {
        self.expiry_timers.remove(&order_id);
        let Some(ao) = self.active_orders.get(&order_id) else {
            return;
        };
        let remaining_ms = ao.order.expiration - now_millis();
        if remaining_ms <= self.config.expiration_threshold.as_millis() as i64 {
            info!(owner = %self.owner, %order_id, "order expired, cancelling");
            self.store_event(QueueEvent::Canceled {
                pair: ao.order.pair,
                order_id,
                reason: CancelReason::Expired,
            });
        } else {
            // Fired early (clock drift or a lost cancel): rearm.
            let ao = ao.clone();
            self.schedule_expiry(&ao);
        }
    }

    fn start_schedules(&mut self) {
        if self.schedules_enabled {
            return;
        }
        self.schedules_enabled = true;
        let orders: Vec<AcceptedOrder> = self.active_orders.values().cloned().collect();
        for ao in orders {
            self.schedule_expiry(&ao);
        }
    }

    // ── Websocket push ──────────────────────────────────────────────

    fn ws_subscribe(&mut self, subscriber: WsSubscriber) {
        debug!(owner = %self.owner, "websocket subscriber registered");
        self.ws.pending.push(subscriber);
        if self.ws.snapshot_in_flight {
            return;
        }
        self.ws.snapshot_in_flight = true;
        let oracle = self.deps.oracle.clone();
        let owner = self.owner;
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = oracle.get_snapshot(owner).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(AccountMessage::WsSnapshot { result });
            }
        });
    }

    fn ws_snapshot(&mut self, result: Result<BalanceMap, NodeError>) {
        self.ws.snapshot_in_flight = false;
        let spendable = match result {
            Ok(spendable) => spendable,
            Err(err) => {
                warn!(owner = %self.owner, %err, "balance snapshot failed, dropping pending subscribers");
                self.ws.pending.clear();
                return;
            }
        };

        let balances: BTreeMap<Asset, WsBalanceEntry> = spendable
            .iter()
            .map(|(asset, value)| {
                let reserved = self.open_volume.get(asset);
                (
                    *asset,
                    WsBalanceEntry {
                        tradable: (*value - reserved).max(Decimal::ZERO),
                        reserved,
                    },
                )
            })
            .collect();

        let mut active: Vec<&AcceptedOrder> = self.active_orders.values().collect();
        active.sort_by_key(|ao| (ao.order.timestamp, ao.order.id));
        let orders = active.into_iter().map(WsOrderUpdate::full).collect();

        self.ws
            .promote_pending(&WsMessage::Snapshot { balances, orders });
        // Snapshot receivers know these orders now; later changes can go
        // out as deltas.
        let ids: Vec<OrderId> = self.active_orders.keys().copied().collect();
        self.ws.mark_tracked(ids);
        if !self.ws.scheduler_running && !self.ws.active.is_empty() {
            self.ws.scheduler_running = true;
            self.schedule_ws_tick();
        }
    }

    fn schedule_ws_tick(&self) {
        let interval = self.config.ws_diff_interval;
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(AccountMessage::WsDiffTick);
            }
        });
    }

    fn ws_diff_tick(&mut self) {
        self.ws.sweep_closed();
        if self.ws.active.is_empty() {
            // Nobody is listening: stop the scheduler and forget the
            // window; the next snapshot restates the world anyway.
            self.ws.scheduler_running = false;
            self.ws.reset_window();
            return;
        }
        if !self.ws.has_staged_changes() {
            self.schedule_ws_tick();
            return;
        }

        let (assets, orders) = self.ws.take_staged();
        if assets.is_empty() {
            // Order-only diff: no balance fetch needed.
            self.ws_diff_fetched(assets, orders, Ok(BalanceMap::new()));
            return;
        }
        let oracle = self.deps.oracle.clone();
        let owner = self.owner;
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = oracle.get(owner, assets.clone()).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(AccountMessage::WsDiffFetched {
                    assets,
                    orders,
                    result,
                });
            }
        });
    }

    fn ws_diff_fetched(
        &mut self,
        assets: BTreeSet<Asset>,
        orders: Vec<WsOrderUpdate>,
        result: Result<BalanceMap, NodeError>,
    ) {
        match result {
            Ok(spendable) => {
                let balances: BTreeMap<Asset, WsBalanceEntry> = assets
                    .iter()
                    .map(|asset| {
                        let reserved = self.open_volume.get(asset);
                        (
                            *asset,
                            WsBalanceEntry {
                                tradable: (spendable.get(asset) - reserved).max(Decimal::ZERO),
                                reserved,
                            },
                        )
                    })
                    .collect();
                self.ws.broadcast_diff(&WsMessage::Diff { balances, orders });
            }
            Err(err) => {
                warn!(owner = %self.owner, %err, "balance fetch for diff failed, retrying next tick");
                self.ws.restage(assets, orders);
            }
        }

        if self.ws.active.is_empty() {
            self.ws.scheduler_running = false;
        } else {
            self.schedule_ws_tick();
        }
    }
}
