//! Background synchronization engine for wallet balances and transaction history.
//!
//! ## Module Structure
//!
//! - `task_queue` - Bounded-concurrency job executor with captured per-job results
//! - `balance` - Batched ERC-20 balance reads through an aggregator contract, with per-token fallback
//! - `reconcile` - Account-model and UTXO transaction fetchers
//! - `merge` - Dedup and confirmation-preserving merge into the per-account store
//! - `scheduler` - Adaptive polling interval and recurring trigger installation
//! - `sync` - Service wiring the pieces into a wake-driven loop
//! - `shared_file` - JSON documents several processes read and update under a file lock
//!
//! Host collaborators (state, RPC, indexer, alarms, locks) are injected through the
//! traits in `state`, `rpc`, `alarm` and `lock`.

pub mod alarm;
pub mod balance;
pub mod config;
pub mod error;
pub mod lock;
pub mod merge;
pub mod reconcile;
pub mod rpc;
pub mod scheduler;
pub mod shared_file;
pub mod state;
pub mod sync;
pub mod sync_settings;
pub mod task_queue;
#[cfg(test)]
mod testing;
pub mod types;
pub mod utils;

pub use error::SyncError;
pub use task_queue::{JobResult, TaskQueue};
pub use types::{Account, BalanceMap, ChainFamily, ChainKey, TransactionRecord};
