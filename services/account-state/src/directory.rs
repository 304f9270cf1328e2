//! Account routing directory
//!
//! Demultiplexes commands, matcher events and balance-change
//! notifications to the right account actor, spawning one on first
//! contact. Holds no per-account state beyond the routing table.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use types::prelude::*;

use crate::actor::{AccountActor, AccountDeps, AccountHandle};
use crate::config::AccountServiceConfig;
use crate::events::MatcherEvent;

pub struct Directory {
    config: AccountServiceConfig,
    deps: AccountDeps,
    accounts: DashMap<Address, AccountHandle>,
    /// Expiry scheduling stays off while order books are being restored
    /// at startup; flipped once by `start_schedules`.
    schedules_started: AtomicBool,
}

impl Directory {
    pub fn new(config: AccountServiceConfig, deps: AccountDeps) -> Self {
        Self {
            config,
            deps,
            accounts: DashMap::new(),
            schedules_started: AtomicBool::new(false),
        }
    }

    /// Handle for an address, spawning its actor on first contact.
    pub fn account(&self, address: Address) -> AccountHandle {
        let entry = self.accounts.entry(address).or_insert_with(|| {
            debug!(%address, "spawning account actor");
            AccountActor::spawn(
                address,
                self.config.clone(),
                self.deps.clone(),
                self.schedules_started.load(Ordering::SeqCst),
            )
        });
        entry.value().clone()
    }

    /// Handle for an address only if its actor already exists.
    pub fn existing(&self, address: Address) -> Option<AccountHandle> {
        self.accounts.get(&address).map(|entry| entry.value().clone())
    }

    /// Route a matching-engine event to the owner of every side it
    /// touches.
    pub fn process_event(&self, event: MatcherEvent) {
        for owner in event.owners() {
            self.account(owner).matcher_event(event.clone());
        }
    }

    /// Push an authoritative balance change: the oracle cache is updated
    /// first, then every already-spawned affected account re-checks its
    /// coverage. Unseen addresses have no state to invalidate.
    pub fn balances_changed(&self, changes: BTreeMap<Address, BalanceSnapshot>) {
        self.deps.oracle.update_states(changes.clone());
        for (address, snapshot) in changes {
            if let Some(handle) = self.existing(address) {
                handle.cancel_uncovered(snapshot);
            }
        }
    }

    /// Turn on expiry scheduling everywhere, once history is restored.
    /// Actors spawned later inherit the flag.
    pub fn start_schedules(&self) {
        if self.schedules_started.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.accounts.iter() {
            entry.value().start_schedules();
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
