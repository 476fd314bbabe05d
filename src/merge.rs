//! Dedup and merge of fetched transactions into the per-account store.
//!
//! Records are matched by identity key (lowercase hash / txid). On collision the
//! record with more confirmations wins, so repeated merges can only raise a stored
//! confirmation count. Timing fields are carried over from the losing record when
//! the winner lacks them; for UTXO `blockTime` the earlier of two values is kept.

use crate::state::StateStore;
use crate::types::{Account, ChainFamily, ChainKey, EvmTransaction, TransactionRecord};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Combine two records sharing an identity key.
fn merge_pair(existing: TransactionRecord, incoming: TransactionRecord) -> TransactionRecord {
    // Ties go to the incoming record, it is the fresher view.
    let (winner, loser) = if incoming.confirmations() >= existing.confirmations() {
        (incoming, existing)
    } else {
        (existing, incoming)
    };

    match (winner, loser) {
        (TransactionRecord::Evm(mut win), TransactionRecord::Evm(lose)) => {
            if win.timestamp.is_none() {
                win.timestamp = lose.timestamp;
            }
            TransactionRecord::Evm(win)
        }
        (TransactionRecord::Utxo(mut win), TransactionRecord::Utxo(lose)) => {
            win.block_time = match (win.block_time, lose.block_time) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            TransactionRecord::Utxo(win)
        }
        (winner, _) => winner,
    }
}

/// Fold records into one per identity key, keeping first-seen order.
pub fn merge_records<I>(records: I) -> Vec<TransactionRecord>
where
    I: IntoIterator<Item = TransactionRecord>,
{
    let mut merged: Vec<Option<TransactionRecord>> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in records {
        let key = record.key();
        match positions.get(&key) {
            Some(&i) => {
                merged[i] = match merged[i].take() {
                    Some(existing) => Some(merge_pair(existing, record)),
                    None => Some(record),
                };
            }
            None => {
                positions.insert(key, merged.len());
                merged.push(Some(record));
            }
        }
    }
    merged.into_iter().flatten().collect()
}

/// Collapse duplicates within a single fetched batch.
pub fn dedupe(transactions: Vec<TransactionRecord>) -> Vec<TransactionRecord> {
    merge_records(transactions)
}

/// Merge fresh records on top of stored ones.
pub fn merge_into(stored: Vec<TransactionRecord>, fresh: Vec<TransactionRecord>) -> Vec<TransactionRecord> {
    merge_records(stored.into_iter().chain(fresh))
}

/// Sole writer of the per-account transaction store.
pub struct MergeEngine {
    store: Arc<dyn StateStore>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Merge a freshly fetched account-model feed into every account's list for the
    /// active chain.
    ///
    /// Only accounts with at least one mined transaction in `fresh` are written.
    /// Returns the active account's merged list when it was updated.
    pub async fn reconcile_account_store(
        &self,
        fresh: &[EvmTransaction],
    ) -> Result<Option<Vec<TransactionRecord>>> {
        let chain = self.store.active_chain().await?;
        if chain.family != ChainFamily::Evm {
            debug!("Active chain {} is not account-model, skipping reconcile", chain);
            return Ok(None);
        }

        let active_id = self.store.active_account().await?.map(|a| a.id);
        let accounts = self.store.accounts().await?;
        let mut hot = None;

        for account in &accounts {
            let Some(merged) = self.reconcile_account(account, chain, fresh).await? else {
                continue;
            };
            if active_id.as_deref() == Some(account.id.as_str()) {
                hot = Some(merged);
            }
        }

        Ok(hot)
    }

    async fn reconcile_account(
        &self,
        account: &Account,
        chain: ChainKey,
        fresh: &[EvmTransaction],
    ) -> Result<Option<Vec<TransactionRecord>>> {
        let Some(address) = account.address else {
            return Ok(None);
        };

        let matching: Vec<TransactionRecord> = fresh
            .iter()
            .filter(|tx| tx.chain_id == chain.chain_id && tx.is_mined() && tx.touches(&address))
            .cloned()
            .map(TransactionRecord::Evm)
            .collect();

        if matching.is_empty() {
            return Ok(None);
        }

        let matched = matching.len();
        let stored = self.store.transactions(&account.id, chain).await?;
        let stored_len = stored.len();
        let merged = merge_into(stored, matching);
        info!(
            "Account {} on {}: {} matched, {} stored -> {} merged",
            account.id,
            chain,
            matched,
            stored_len,
            merged.len()
        );

        self.store.set_transactions(&account.id, chain, merged.clone()).await?;
        Ok(Some(merged))
    }

    /// Merge UTXO records for one account and chain.
    ///
    /// Returns `None` without writing when the merge changes nothing.
    pub async fn reconcile_utxo_store(
        &self,
        account_id: &str,
        chain: ChainKey,
        fresh: Vec<TransactionRecord>,
    ) -> Result<Option<Vec<TransactionRecord>>> {
        let stored = self.store.transactions(account_id, chain).await?;
        let merged = merge_into(stored.clone(), fresh);
        if merged == stored {
            debug!("Account {} on {}: nothing new", account_id, chain);
            return Ok(None);
        }

        info!(
            "Account {} on {}: {} stored -> {} merged",
            account_id,
            chain,
            stored.len(),
            merged.len()
        );
        self.store.set_transactions(account_id, chain, merged.clone()).await?;
        Ok(Some(merged))
    }
}
