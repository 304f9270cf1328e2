//! In-memory collaborators and a loopback matching engine for
//! integration tests.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use account_state::balances::BalanceOracleHandle;
use account_state::events::{CancelReason, MatcherEvent, QueueEvent};
use account_state::gateways::{NodeClient, NodeError, OrderDb, StoreError, StoreSink};
use account_state::{AccountDeps, AccountServiceConfig, Directory};
use types::prelude::*;

pub fn usd() -> Asset {
    Asset::issued(AssetId::from_uuid(Uuid::from_u128(0xAA)))
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Limit buy of `amount` native priced in usd, fee paid in native.
pub fn limit_buy(sender: Address, amount: &str, price: u64) -> Order {
    Order {
        id: OrderId::new(),
        sender,
        pair: AssetPair::new(Asset::Native, usd()),
        side: Side::Buy,
        price: Price::from_u64(price),
        amount: Quantity::from_str(amount).unwrap(),
        matcher_fee: Quantity::from_str("0.003").unwrap(),
        fee_asset: Asset::Native,
        timestamp: now_millis(),
        expiration: now_millis() + 86_400_000,
    }
}

// ── Chain node fake ─────────────────────────────────────────────────

pub struct FakeNode {
    balances: Mutex<BTreeMap<Address, BTreeMap<Asset, Decimal>>>,
    chain_orders: Mutex<BTreeSet<OrderId>>,
    pub balance_calls: AtomicUsize,
    balance_gate: Mutex<Option<Arc<Semaphore>>>,
    fail_balances: Mutex<Option<NodeError>>,
}

impl FakeNode {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(BTreeMap::new()),
            chain_orders: Mutex::new(BTreeSet::new()),
            balance_calls: AtomicUsize::new(0),
            balance_gate: Mutex::new(None),
            fail_balances: Mutex::new(None),
        }
    }

    pub fn set_balance(&self, address: Address, asset: Asset, value: &str) {
        self.balances
            .lock()
            .unwrap()
            .entry(address)
            .or_default()
            .insert(asset, Decimal::from_str_exact(value).unwrap());
    }

    pub fn add_chain_order(&self, id: OrderId) {
        self.chain_orders.lock().unwrap().insert(id);
    }

    /// Make every balance query block until a permit is added to the
    /// returned semaphore.
    pub fn hold_balance_queries(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.balance_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_balance_queries(&self, error: NodeError) {
        *self.fail_balances.lock().unwrap() = Some(error);
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        let gate = self.balance_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn spendable_balances(
        &self,
        address: Address,
        assets: BTreeSet<Asset>,
    ) -> Result<BalanceMap, NodeError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        if let Some(err) = self.fail_balances.lock().unwrap().clone() {
            return Err(err);
        }
        let balances = self.balances.lock().unwrap();
        let held = balances.get(&address).cloned().unwrap_or_default();
        Ok(assets
            .into_iter()
            .map(|a| (a, held.get(&a).copied().unwrap_or(Decimal::ZERO)))
            .collect())
    }

    async fn all_spendable_balances(&self, address: Address) -> Result<BalanceMap, NodeError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        if let Some(err) = self.fail_balances.lock().unwrap().clone() {
            return Err(err);
        }
        let balances = self.balances.lock().unwrap();
        Ok(balances
            .get(&address)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect())
    }

    async fn has_order(&self, id: OrderId) -> Result<bool, NodeError> {
        Ok(self.chain_orders.lock().unwrap().contains(&id))
    }
}

// ── Order DB fake ───────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryOrderDb {
    orders: Mutex<HashMap<OrderId, Order>>,
    infos: Mutex<HashMap<OrderId, (Address, OrderInfo)>>,
}

impl OrderDb for InMemoryOrderDb {
    fn save_order(&self, order: &Order) {
        self.orders.lock().unwrap().insert(order.id, order.clone());
    }

    fn save_order_info(&self, owner: Address, info: &OrderInfo) {
        self.infos
            .lock()
            .unwrap()
            .insert(info.id, (owner, info.clone()));
    }

    fn status(&self, id: OrderId) -> OrderStatus {
        self.infos
            .lock()
            .unwrap()
            .get(&id)
            .map(|(_, info)| info.status.clone())
            .unwrap_or(OrderStatus::NotFound)
    }

    fn contains_info(&self, id: OrderId) -> bool {
        self.infos.lock().unwrap().contains_key(&id)
    }

    fn load_remaining_orders(
        &self,
        owner: Address,
        pair: Option<&AssetPair>,
        known_active: &BTreeSet<OrderId>,
    ) -> Vec<OrderInfo> {
        self.infos
            .lock()
            .unwrap()
            .values()
            .filter(|(info_owner, _)| *info_owner == owner)
            .filter(|(_, info)| pair.map_or(true, |p| info.pair == *p))
            .filter(|(_, info)| !known_active.contains(&info.id))
            .map(|(_, info)| info.clone())
            .collect()
    }
}

// ── Store sink fake ─────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
pub enum StoreMode {
    Ok,
    Disabled,
    Fail,
}

pub struct RecordingStore {
    mode: Mutex<StoreMode>,
    events: Mutex<Vec<QueueEvent>>,
    forward: mpsc::UnboundedSender<QueueEvent>,
}

impl RecordingStore {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<QueueEvent>) {
        let (forward, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                mode: Mutex::new(StoreMode::Ok),
                events: Mutex::new(Vec::new()),
                forward,
            }),
            rx,
        )
    }

    pub fn set_mode(&self, mode: StoreMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn canceled_events(&self) -> Vec<(OrderId, CancelReason)> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                QueueEvent::Canceled {
                    order_id, reason, ..
                } => Some((order_id, reason)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl StoreSink for RecordingStore {
    async fn store(&self, event: QueueEvent) -> Result<Option<u64>, StoreError> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            StoreMode::Ok => {
                let offset = {
                    let mut events = self.events.lock().unwrap();
                    events.push(event.clone());
                    events.len() as u64
                };
                let _ = self.forward.send(event);
                Ok(Some(offset))
            }
            StoreMode::Disabled => Ok(None),
            StoreMode::Fail => Err(StoreError::Unavailable("store down".into())),
        }
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// Directory plus fakes, with a loopback matching engine that turns
/// persisted intents straight into matcher events.
pub struct TestExchange {
    pub directory: Arc<Directory>,
    pub node: Arc<FakeNode>,
    pub store: Arc<RecordingStore>,
    pub db: Arc<InMemoryOrderDb>,
    pub oracle: BalanceOracleHandle,
}

impl TestExchange {
    pub fn start() -> Self {
        Self::start_with_config(AccountServiceConfig::default())
    }

    pub fn start_with_config(config: AccountServiceConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let node = Arc::new(FakeNode::new());
        let (store, store_rx) = RecordingStore::new();
        let db = Arc::new(InMemoryOrderDb::default());
        let oracle = BalanceOracleHandle::spawn(node.clone());
        let deps = AccountDeps {
            node: node.clone(),
            oracle: oracle.clone(),
            order_db: db.clone(),
            store: store.clone(),
        };
        let directory = Arc::new(Directory::new(config, deps));
        spawn_matcher_pump(store_rx, directory.clone());
        Self {
            directory,
            node,
            store,
            db,
            oracle,
        }
    }
}

/// Loopback matching engine: every persisted placement is immediately
/// added to the book, every persisted cancel immediately cancels.
fn spawn_matcher_pump(mut rx: mpsc::UnboundedReceiver<QueueEvent>, directory: Arc<Directory>) {
    tokio::spawn(async move {
        let mut book: HashMap<OrderId, AcceptedOrder> = HashMap::new();
        while let Some(event) = rx.recv().await {
            match event {
                QueueEvent::Placed(order) | QueueEvent::PlacedMarket(order) => {
                    book.insert(order.id(), order.clone());
                    directory.process_event(MatcherEvent::OrderAdded { order });
                }
                QueueEvent::Canceled {
                    order_id, reason, ..
                } => {
                    if let Some(order) = book.remove(&order_id) {
                        directory.process_event(MatcherEvent::OrderCanceled {
                            order,
                            is_system: !matches!(reason, CancelReason::Requested),
                        });
                    }
                }
            }
        }
    });
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(deadline_ms: u64, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
