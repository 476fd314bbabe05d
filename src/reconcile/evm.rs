use super::DEFAULT_LOOKBACK;
use crate::rpc::EvmRpc;
use crate::state::StateStore;
use crate::task_queue::TaskQueue;
use crate::types::{BlockHeader, ChainKey, EvmTransaction};
use anyhow::{anyhow, Result};
use ethers::types::{Block, Transaction, H256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Recent-window scanner for account-model chains.
pub struct EvmReconciler {
    rpc: Arc<dyn EvmRpc>,
    store: Arc<dyn StateStore>,
    chain_id: u64,
    lookback: u64,
    backfill_pool: usize,
}

impl EvmReconciler {
    pub fn new(rpc: Arc<dyn EvmRpc>, store: Arc<dyn StateStore>, chain_id: u64) -> Self {
        Self {
            rpc,
            store,
            chain_id,
            lookback: DEFAULT_LOOKBACK,
            backfill_pool: 3,
        }
    }

    pub fn with_lookback(mut self, blocks: u64) -> Self {
        self.lookback = blocks.max(1);
        self
    }

    pub fn with_backfill_pool(mut self, pool: usize) -> Self {
        self.backfill_pool = pool;
        self
    }

    pub fn chain(&self) -> ChainKey {
        ChainKey::evm(self.chain_id)
    }

    /// Transactions from blocks `[from_block, to_block)`.
    ///
    /// A transaction in the last requested block has one confirmation. The newest
    /// fetched block is published as the chain's current block.
    pub async fn fetch_recent_transactions(&self, from_block: u64, to_block: u64) -> Result<Vec<EvmTransaction>> {
        if to_block <= from_block {
            return Ok(Vec::new());
        }

        let numbers: Vec<u64> = (from_block..to_block).collect();
        let blocks = self.rpc.get_blocks_with_txs(&numbers).await?;

        let mut transactions = Vec::new();
        let mut newest: Option<(u64, &Block<Transaction>)> = None;

        for block in blocks.iter().flatten() {
            let Some(number) = block.number.map(|n| n.as_u64()) else {
                continue;
            };
            if newest.map_or(true, |(n, _)| n < number) {
                newest = Some((number, block));
            }

            let timestamp = block.timestamp.low_u64();
            for tx in &block.transactions {
                if tx.to.is_none() && tx.from.is_zero() {
                    continue;
                }
                transactions.push(EvmTransaction {
                    hash: tx.hash,
                    from: tx.from,
                    to: tx.to,
                    block_number: Some(number),
                    block_hash: tx.block_hash.or(block.hash),
                    confirmations: to_block.saturating_sub(number),
                    chain_id: self.chain_id,
                    timestamp: (timestamp > 0).then_some(timestamp),
                });
            }
        }

        if let Some((_, block)) = newest {
            self.store.set_current_block(self.chain(), block_header(block)).await?;
        }

        debug!(
            "Scanned blocks {}..{} on chain {}: {} transactions",
            from_block,
            to_block,
            self.chain_id,
            transactions.len()
        );
        Ok(transactions)
    }

    /// Scan the lookback window ending at the current head.
    pub async fn first_run(&self) -> Result<Vec<EvmTransaction>> {
        let latest = self.rpc.block_number().await?;
        let to_block = latest + 1;
        let from_block = to_block.saturating_sub(self.lookback);
        self.fetch_recent_transactions(from_block, to_block).await
    }

    /// One polling pass: rescan the window, then backfill missing timestamps.
    pub async fn poll(&self) -> Result<Vec<EvmTransaction>> {
        let mut transactions = self.first_run().await?;

        let missing: Vec<(usize, H256)> = transactions
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.timestamp.is_none())
            .map(|(i, tx)| (i, tx.hash))
            .collect();

        if !missing.is_empty() {
            let queue = TaskQueue::new(self.backfill_pool)?;
            for (_, hash) in &missing {
                let rpc = Arc::clone(&self.rpc);
                let hash = *hash;
                queue.execute(move || async move { mined_timestamp(rpc.as_ref(), hash).await });
            }

            let mut filled = 0;
            for ((index, hash), result) in missing.iter().zip(queue.done().await) {
                match (result.result, result.error) {
                    (Some(timestamp), _) => {
                        transactions[*index].timestamp = Some(timestamp);
                        filled += 1;
                    }
                    (None, Some(e)) => warn!("Timestamp backfill failed for {:#x}: {}", hash, e),
                    (None, None) => {}
                }
            }
            debug!("Backfilled {}/{} timestamps", filled, missing.len());
        }

        info!(
            "Polled chain {}: {} transactions in the last {} blocks",
            self.chain_id,
            transactions.len(),
            self.lookback
        );
        Ok(transactions)
    }
}

async fn mined_timestamp(rpc: &dyn EvmRpc, hash: H256) -> Result<u64> {
    let tx = rpc
        .get_transaction(hash)
        .await?
        .ok_or_else(|| anyhow!("transaction {:#x} not found", hash))?;
    let number = tx
        .block_number
        .ok_or_else(|| anyhow!("transaction {:#x} is not mined", hash))?;
    let block = rpc
        .get_block(number.as_u64())
        .await?
        .ok_or_else(|| anyhow!("block {} not found", number))?;
    Ok(block.timestamp.low_u64())
}

fn block_header<T>(block: &Block<T>) -> BlockHeader {
    BlockHeader {
        number: block.number.map(|n| n.as_u64()).unwrap_or_default(),
        hash: block.hash,
        timestamp: block.timestamp.low_u64(),
        gas_limit: block.gas_limit,
        base_fee_per_gas: block.base_fee_per_gas,
    }
}
