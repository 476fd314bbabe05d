use super::DEFAULT_LOOKBACK;
use crate::merge::{dedupe, MergeEngine};
use crate::rpc::UtxoBackend;
use crate::types::{ChainKey, TransactionRecord, UtxoTransaction};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Indexer-backed reconciler for UTXO chains, keyed by extended public key.
pub struct UtxoReconciler {
    backend: Arc<dyn UtxoBackend>,
    merge: Arc<MergeEngine>,
    page_size: u32,
}

impl UtxoReconciler {
    pub fn new(backend: Arc<dyn UtxoBackend>, merge: Arc<MergeEngine>) -> Self {
        Self {
            backend,
            merge,
            page_size: DEFAULT_LOOKBACK as u32,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Latest transactions for `xpub`, with full input/output detail.
    pub async fn fetch_by_xpub(&self, xpub: &str) -> Result<Vec<UtxoTransaction>> {
        let txs = self
            .backend
            .xpub_transactions(xpub, self.page_size)
            .await
            .with_context(|| format!("xpub fetch failed (page size {})", self.page_size))?;
        debug!("Indexer returned {} transactions", txs.len());
        Ok(txs)
    }

    /// Fetch and merge into `account_id`'s list for `chain`.
    ///
    /// `Ok(None)` means there was nothing to update, which is distinct from
    /// `Ok(Some(vec![]))`.
    pub async fn poll(
        &self,
        account_id: &str,
        xpub: &str,
        chain: ChainKey,
    ) -> Result<Option<Vec<TransactionRecord>>> {
        let fetched = self.fetch_by_xpub(xpub).await?;
        let fresh = dedupe(fetched.into_iter().map(TransactionRecord::Utxo).collect());
        if fresh.is_empty() {
            debug!("No transactions for account {} on {}", account_id, chain);
            return Ok(None);
        }

        let merged = self.merge.reconcile_utxo_store(account_id, chain, fresh).await?;
        if let Some(list) = &merged {
            info!("Account {} on {}: {} transactions after merge", account_id, chain, list.len());
        }
        Ok(merged)
    }
}
