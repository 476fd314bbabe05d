//! Error kinds callers may want to match on.
//!
//! Everything else travels as `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("task queue pool size must be positive, got {0}")]
    InvalidPoolSize(usize),

    #[error("no active account selected")]
    NoActiveAccount,

    #[error("no aggregator contract configured for chain {0}")]
    AggregatorUnavailable(u64),

    #[error("account {0} has no extended public key")]
    MissingXpub(String),

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("timed out waiting for lock '{0}'")]
    LockTimeout(String),
}
