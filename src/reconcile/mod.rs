//! Transaction reconcilers, one per chain family.
//!
//! Both re-scan a fixed recent window on every tick instead of tracking a cursor,
//! so a missed tick or a shallow reorg is absorbed by the next pass.

pub mod evm;
pub mod utxo;

pub use evm::EvmReconciler;
pub use utxo::UtxoReconciler;

/// Blocks (account-model) or transactions (UTXO) re-scanned per pass.
pub const DEFAULT_LOOKBACK: u64 = 30;
