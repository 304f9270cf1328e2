//! Account State Service
//!
//! Owns the authoritative in-memory view of each trading account's open
//! orders, the assets those orders reserve against on-chain spendable
//! balances, and the push channel that streams balance/order changes to
//! subscribed websocket clients.
//!
//! # Architecture
//!
//! ```text
//!  Client commands          Matching engine events      Chain watcher
//!        │                          │                        │
//!    ┌───▼──────────────────────────▼────────────────────────▼───┐
//!    │                        Directory                          │
//!    │        (lazy per-address spawn, event fan-out)            │
//!    └───┬───────────────────────────────────────────────────┬───┘
//!        │ one mailbox per address                            │
//!    ┌───▼────────────┐                              ┌────────▼───────┐
//!    │  AccountActor  │── spendable balance asks ───►│  BalanceOracle │
//!    │ orders/volume/ │◄─ snapshots, cached reads ───│ per-addr cache │
//!    │ expiry/ws-diff │                              └────────┬───────┘
//!    └───┬────────────┘                                       │
//!        │ placement / cancel intents                  chain node client
//!    ┌───▼───────┐
//!    │ StoreSink │  (append-only event log)
//!    └───────────┘
//! ```
//!
//! Every account runs as a single cooperative task: at most one message
//! is handled at a time, and every suspension (validation, balance asks,
//! event persistence) folds its result back into the mailbox as a
//! self-sent message rather than mutating state from another task.

pub mod actor;
pub mod balances;
pub mod config;
pub mod directory;
pub mod events;
pub mod gateways;
pub mod uncovered;
pub mod validation;
pub mod ws;

pub use actor::{
    AccountActor, AccountDeps, AccountHandle, BatchCancelOutcome, CancelOutcome, PlacementOutcome,
};
pub use balances::BalanceOracleHandle;
pub use config::AccountServiceConfig;
pub use directory::Directory;
