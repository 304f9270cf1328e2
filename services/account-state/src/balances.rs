//! Balance oracle: per-address spendable balance cache
//!
//! Caches the chain node's answers so that repeated balance asks for the
//! same address do not hammer the node. Three write paths exist:
//!
//! - node fetches, triggered by cache misses, at most one in flight per
//!   address (later queries queue FIFO behind it and are re-evaluated
//!   once it lands);
//! - authoritative pushes from the chain watch stream (`update_states`),
//!   merged asset-wise;
//! - speculative `subtract` overlays from account actors when a fill
//!   reduces reserves before the trade settles on-chain. Reads see
//!   `known − overlay`; the next authoritative push for an asset
//!   supersedes its overlay entry.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use types::prelude::*;

use crate::gateways::{NodeClient, NodeError};

/// What a queued query wants to see.
#[derive(Debug, Clone)]
enum QueryScope {
    Subset(BTreeSet<Asset>),
    Full,
}

struct PendingQuery {
    scope: QueryScope,
    reply: oneshot::Sender<Result<BalanceMap, NodeError>>,
}

/// Cache entry for one address.
#[derive(Default)]
struct CachedBalance {
    /// Asset values the cache knows, including explicit zeros.
    known: BTreeMap<Asset, Decimal>,
    /// Whether `known` covers every asset the address holds.
    full: bool,
    /// Speculative subtractions applied on top of `known`.
    overlay: BTreeMap<Asset, Decimal>,
    /// The query the current node fetch serves, if any.
    in_flight: Option<PendingQuery>,
    /// Queries waiting for the in-flight fetch to land.
    waiting: VecDeque<PendingQuery>,
}

impl CachedBalance {
    fn can_serve(&self, scope: &QueryScope) -> bool {
        match scope {
            QueryScope::Full => self.full,
            QueryScope::Subset(assets) => {
                self.full || assets.iter().all(|a| self.known.contains_key(a))
            }
        }
    }

    /// Cached view with the speculative overlay applied, clamped at zero.
    fn read(&self, scope: &QueryScope) -> BalanceMap {
        let overlayed = |asset: &Asset| {
            let known = self.known.get(asset).copied().unwrap_or(Decimal::ZERO);
            let overlay = self.overlay.get(asset).copied().unwrap_or(Decimal::ZERO);
            (known - overlay).max(Decimal::ZERO)
        };
        match scope {
            QueryScope::Full => self.known.keys().map(|a| (*a, overlayed(a))).collect(),
            QueryScope::Subset(assets) => assets.iter().map(|a| (*a, overlayed(a))).collect(),
        }
    }
}

enum OracleCommand {
    Get {
        address: Address,
        assets: BTreeSet<Asset>,
        reply: oneshot::Sender<Result<BalanceMap, NodeError>>,
    },
    GetSnapshot {
        address: Address,
        reply: oneshot::Sender<Result<BalanceMap, NodeError>>,
    },
    UpdateStates {
        changes: BTreeMap<Address, BalanceSnapshot>,
    },
    Subtract {
        address: Address,
        delta: BalanceMap,
    },
    FetchDone {
        address: Address,
        result: Result<BalanceMap, NodeError>,
    },
}

/// Cloneable handle to the process-wide balance oracle.
#[derive(Clone)]
pub struct BalanceOracleHandle {
    tx: mpsc::UnboundedSender<OracleCommand>,
}

impl BalanceOracleHandle {
    /// Spawn the oracle task over the given node client.
    pub fn spawn(node: Arc<dyn NodeClient>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let oracle = BalanceOracle {
            node,
            accounts: HashMap::new(),
            self_tx: tx.downgrade(),
        };
        tokio::spawn(oracle.run(rx));
        Self { tx }
    }

    /// Spendable balances for a subset of assets; missing assets read as
    /// zero on the returned map.
    pub async fn get(
        &self,
        address: Address,
        assets: BTreeSet<Asset>,
    ) -> Result<BalanceMap, NodeError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(OracleCommand::Get {
                address,
                assets,
                reply,
            })
            .is_err()
        {
            return Err(NodeError::Unexpected("balance oracle stopped".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(NodeError::Unexpected("balance oracle stopped".into())))
    }

    /// Spendable balances across all assets of the address.
    pub async fn get_snapshot(&self, address: Address) -> Result<BalanceMap, NodeError> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(OracleCommand::GetSnapshot { address, reply })
            .is_err()
        {
            return Err(NodeError::Unexpected("balance oracle stopped".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(NodeError::Unexpected("balance oracle stopped".into())))
    }

    /// Authoritative partial update from the chain watch stream.
    pub fn update_states(&self, changes: BTreeMap<Address, BalanceSnapshot>) {
        let _ = self.tx.send(OracleCommand::UpdateStates { changes });
    }

    /// Speculative reserve-drop overlay from an account actor.
    pub fn subtract(&self, address: Address, delta: BalanceMap) {
        let _ = self.tx.send(OracleCommand::Subtract { address, delta });
    }
}

struct BalanceOracle {
    node: Arc<dyn NodeClient>,
    accounts: HashMap<Address, CachedBalance>,
    self_tx: mpsc::WeakUnboundedSender<OracleCommand>,
}

impl BalanceOracle {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<OracleCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!("balance oracle stopped");
    }

    fn handle(&mut self, command: OracleCommand) {
        match command {
            OracleCommand::Get {
                address,
                assets,
                reply,
            } => self.enqueue(
                address,
                PendingQuery {
                    scope: QueryScope::Subset(assets),
                    reply,
                },
            ),
            OracleCommand::GetSnapshot { address, reply } => self.enqueue(
                address,
                PendingQuery {
                    scope: QueryScope::Full,
                    reply,
                },
            ),
            OracleCommand::UpdateStates { changes } => self.update_states(changes),
            OracleCommand::Subtract { address, delta } => self.subtract(address, delta),
            OracleCommand::FetchDone { address, result } => self.fetch_done(address, result),
        }
    }

    fn enqueue(&mut self, address: Address, query: PendingQuery) {
        let entry = self.accounts.entry(address).or_default();
        if entry.can_serve(&query.scope) {
            let _ = query.reply.send(Ok(entry.read(&query.scope)));
            return;
        }
        entry.waiting.push_back(query);
        self.launch_next(address);
    }

    /// Start a node fetch for the next unserved query, unless one is
    /// already in flight for this address.
    fn launch_next(&mut self, address: Address) {
        let entry = self.accounts.entry(address).or_default();
        if entry.in_flight.is_some() {
            return;
        }
        while let Some(query) = entry.waiting.pop_front() {
            if entry.can_serve(&query.scope) {
                let _ = query.reply.send(Ok(entry.read(&query.scope)));
                continue;
            }
            let scope = query.scope.clone();
            entry.in_flight = Some(query);
            let node = Arc::clone(&self.node);
            let self_tx = self.self_tx.clone();
            tokio::spawn(async move {
                let result = match scope {
                    QueryScope::Subset(assets) => node.spendable_balances(address, assets).await,
                    QueryScope::Full => node.all_spendable_balances(address).await,
                };
                if let Some(tx) = self_tx.upgrade() {
                    let _ = tx.send(OracleCommand::FetchDone { address, result });
                }
            });
            return;
        }
    }

    fn fetch_done(&mut self, address: Address, result: Result<BalanceMap, NodeError>) {
        let entry = self.accounts.entry(address).or_default();
        let Some(query) = entry.in_flight.take() else {
            warn!(%address, "fetch completion without an in-flight query");
            return;
        };
        match result {
            Ok(balances) => {
                match &query.scope {
                    QueryScope::Subset(assets) => {
                        // Mark every requested asset as known, including
                        // the ones the node reported as zero.
                        for asset in assets {
                            entry.known.insert(*asset, balances.get(asset));
                        }
                    }
                    QueryScope::Full => {
                        entry.known = balances.iter().map(|(a, v)| (*a, *v)).collect();
                        entry.full = true;
                    }
                }
                let _ = query.reply.send(Ok(entry.read(&query.scope)));
            }
            Err(err) => {
                let _ = query.reply.send(Err(err));
            }
        }
        self.launch_next(address);
    }

    fn update_states(&mut self, changes: BTreeMap<Address, BalanceSnapshot>) {
        for (address, snapshot) in changes {
            let entry = self.accounts.entry(address).or_default();
            for (asset, value) in snapshot {
                entry.known.insert(asset, value);
                entry.overlay.remove(&asset);
            }
        }
    }

    fn subtract(&mut self, address: Address, delta: BalanceMap) {
        let entry = self.accounts.entry(address).or_default();
        for (asset, value) in delta.iter() {
            *entry.overlay.entry(*asset).or_insert(Decimal::ZERO) += *value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingNode {
        balances: Mutex<BTreeMap<Address, BTreeMap<Asset, Decimal>>>,
        calls: AtomicUsize,
    }

    impl CountingNode {
        fn new() -> Self {
            Self {
                balances: Mutex::new(BTreeMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn set(&self, address: Address, asset: Asset, value: i64) {
            self.balances
                .lock()
                .unwrap()
                .entry(address)
                .or_default()
                .insert(asset, Decimal::from(value));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NodeClient for CountingNode {
        async fn spendable_balances(
            &self,
            address: Address,
            assets: BTreeSet<Asset>,
        ) -> Result<BalanceMap, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let balances = self.balances.lock().unwrap();
            let held = balances.get(&address).cloned().unwrap_or_default();
            Ok(assets
                .into_iter()
                .map(|a| (a, held.get(&a).copied().unwrap_or(Decimal::ZERO)))
                .collect())
        }

        async fn all_spendable_balances(&self, address: Address) -> Result<BalanceMap, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let balances = self.balances.lock().unwrap();
            Ok(balances
                .get(&address)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect())
        }

        async fn has_order(&self, _id: OrderId) -> Result<bool, NodeError> {
            Ok(false)
        }
    }

    fn asset(n: u128) -> Asset {
        Asset::issued(AssetId::from_uuid(uuid::Uuid::from_u128(n)))
    }

    fn set_of(assets: &[Asset]) -> BTreeSet<Asset> {
        assets.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_pushed_states_serve_without_node_calls() {
        let node = Arc::new(CountingNode::new());
        let oracle = BalanceOracleHandle::spawn(node.clone());
        let bob = Address::new();
        let (native, eth) = (Asset::Native, asset(2));

        oracle.update_states(BTreeMap::from([(
            bob,
            BTreeMap::from([(native, Decimal::from(300)), (eth, Decimal::from(5))]),
        )]));

        let view = oracle.get(bob, set_of(&[native, eth])).await.unwrap();
        assert_eq!(view.get(&native), Decimal::from(300));
        assert_eq!(view.get(&eth), Decimal::from(5));
        assert_eq!(node.calls(), 0);
    }

    #[tokio::test]
    async fn test_subset_queries_cache_per_asset() {
        let node = Arc::new(CountingNode::new());
        let oracle = BalanceOracleHandle::spawn(node.clone());
        let alice = Address::new();
        let (native, usd, btc) = (Asset::Native, asset(1), asset(3));
        node.set(alice, native, 42);

        oracle.get(alice, set_of(&[native])).await.unwrap();
        assert_eq!(node.calls(), 1);

        // Same subset again: served from cache.
        let view = oracle.get(alice, set_of(&[native])).await.unwrap();
        assert_eq!(view.get(&native), Decimal::from(42));
        assert_eq!(node.calls(), 1);

        // Unknown asset forces a second call.
        oracle.get(alice, set_of(&[usd])).await.unwrap();
        assert_eq!(node.calls(), 2);

        // Partially known set still forces a call.
        oracle.get(alice, set_of(&[native, btc])).await.unwrap();
        assert_eq!(node.calls(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_cached_and_reused_for_subsets() {
        let node = Arc::new(CountingNode::new());
        let oracle = BalanceOracleHandle::spawn(node.clone());
        let addr = Address::new();
        node.set(addr, Asset::Native, 7);

        oracle.get_snapshot(addr).await.unwrap();
        oracle.get_snapshot(addr).await.unwrap();
        assert_eq!(node.calls(), 1);

        // Full snapshot answers any subset, even for unseen assets.
        let view = oracle.get(addr, set_of(&[asset(9)])).await.unwrap();
        assert_eq!(view.get(&asset(9)), Decimal::ZERO);
        assert_eq!(node.calls(), 1);
    }

    #[tokio::test]
    async fn test_subtract_overlays_until_authoritative_update() {
        let node = Arc::new(CountingNode::new());
        let oracle = BalanceOracleHandle::spawn(node.clone());
        let addr = Address::new();
        let usd = asset(1);

        oracle.update_states(BTreeMap::from([(
            addr,
            BTreeMap::from([(usd, Decimal::from(100))]),
        )]));
        oracle.subtract(addr, BalanceMap::from_entries([(usd, Decimal::from(30))]));

        let view = oracle.get(addr, set_of(&[usd])).await.unwrap();
        assert_eq!(view.get(&usd), Decimal::from(70));

        // Authoritative update supersedes the overlay.
        oracle.update_states(BTreeMap::from([(
            addr,
            BTreeMap::from([(usd, Decimal::from(50))]),
        )]));
        let view = oracle.get(addr, set_of(&[usd])).await.unwrap();
        assert_eq!(view.get(&usd), Decimal::from(50));
    }

    #[tokio::test]
    async fn test_overlay_clamps_at_zero() {
        let node = Arc::new(CountingNode::new());
        let oracle = BalanceOracleHandle::spawn(node.clone());
        let addr = Address::new();
        let usd = asset(1);

        oracle.update_states(BTreeMap::from([(
            addr,
            BTreeMap::from([(usd, Decimal::from(10))]),
        )]));
        oracle.subtract(addr, BalanceMap::from_entries([(usd, Decimal::from(25))]));

        let view = oracle.get(addr, set_of(&[usd])).await.unwrap();
        assert_eq!(view.get(&usd), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_identical_queries_share_one_fetch() {
        let node = Arc::new(CountingNode::new());
        let oracle = BalanceOracleHandle::spawn(node.clone());
        let addr = Address::new();
        let usd = asset(1);
        node.set(addr, usd, 5);

        let (a, b) = tokio::join!(
            oracle.get(addr, set_of(&[usd])),
            oracle.get(addr, set_of(&[usd]))
        );
        assert_eq!(a.unwrap().get(&usd), Decimal::from(5));
        assert_eq!(b.unwrap().get(&usd), Decimal::from(5));
        assert_eq!(node.calls(), 1, "second query must ride the first fetch");
    }
}
