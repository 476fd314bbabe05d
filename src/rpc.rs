//! Network seams: account-model JSON-RPC and the UTXO xpub indexer.
//!
//! Reconcilers and the balance batcher only talk to these traits, so tests can
//! substitute in-memory fakes.

use crate::error::SyncError;
use crate::task_queue::TaskQueue;
use crate::types::{UtxoInput, UtxoOutput, UtxoTransaction};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Block requests in flight at once while scanning a window.
pub const BLOCK_FETCH_POOL: usize = 3;

/// Run `fetch` for every item through a [`TaskQueue`] of `pool` slots and
/// return the values in item order. The first failed item fails the call.
pub async fn paced_fetch<I, T, F, Fut>(items: &[I], pool: usize, fetch: F) -> Result<Vec<T>>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let queue = TaskQueue::new(pool)?;
    for item in items {
        let fetch = fetch.clone();
        let item = item.clone();
        queue.execute(move || fetch(item));
    }
    queue
        .done()
        .await
        .into_iter()
        .map(|job| match (job.result, job.error) {
            (Some(value), _) => Ok(value),
            (None, Some(e)) => Err(e),
            (None, None) => Err(anyhow!("request produced no result")),
        })
        .collect()
}

/// Read-only account-model RPC surface used by the sync engine.
#[async_trait]
pub trait EvmRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    /// Fetch several blocks with full transaction bodies, in request order.
    /// Any single failure fails the whole batch.
    async fn get_blocks_with_txs(&self, numbers: &[u64]) -> Result<Vec<Option<Block<Transaction>>>>;

    async fn get_block(&self, number: u64) -> Result<Option<Block<H256>>>;

    async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;
}

#[async_trait]
impl EvmRpc for Provider<Http> {
    async fn block_number(&self) -> Result<u64> {
        let number = self.get_block_number().await.context("eth_blockNumber failed")?;
        Ok(number.as_u64())
    }

    async fn get_blocks_with_txs(&self, numbers: &[u64]) -> Result<Vec<Option<Block<Transaction>>>> {
        let provider = self.clone();
        let blocks = paced_fetch(numbers, BLOCK_FETCH_POOL, move |n: u64| {
            let provider = provider.clone();
            async move {
                Middleware::get_block_with_txs(&provider, BlockNumber::Number(n.into()))
                    .await
                    .with_context(|| format!("eth_getBlockByNumber({}) failed", n))
            }
        })
        .await
        .context("eth_getBlockByNumber batch failed")?;
        Ok(blocks)
    }

    async fn get_block(&self, number: u64) -> Result<Option<Block<H256>>> {
        let block = Middleware::get_block(self, BlockNumber::Number(number.into()))
            .await
            .with_context(|| format!("eth_getBlockByNumber({}) failed", number))?;
        Ok(block)
    }

    async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>> {
        let tx = Middleware::get_transaction(self, hash)
            .await
            .with_context(|| format!("eth_getTransactionByHash({:#x}) failed", hash))?;
        Ok(tx)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx = TransactionRequest::new().to(to).data(data);
        let result = Middleware::call(self, &tx.into(), None)
            .await
            .with_context(|| format!("eth_call to {:?} failed", to))?;
        Ok(result)
    }
}

/// UTXO indexer keyed by extended public key.
#[async_trait]
pub trait UtxoBackend: Send + Sync {
    /// Most recent `page_size` transactions for `xpub`, with full detail.
    async fn xpub_transactions(&self, xpub: &str, page_size: u32) -> Result<Vec<UtxoTransaction>>;
}

/// Blockbook-compatible indexer client.
pub struct BlockbookClient {
    base_url: Url,
    http: reqwest::Client,
}

impl BlockbookClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("invalid backend url '{}'", base_url))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(Self { base_url, http })
    }

    fn xpub_url(&self, xpub: &str, page_size: u32) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("api/v2/xpub/{}", xpub))
            .context("failed to build xpub url")?;
        url.query_pairs_mut()
            .append_pair("details", "txs")
            .append_pair("pageSize", &page_size.to_string());
        Ok(url)
    }
}

#[async_trait]
impl UtxoBackend for BlockbookClient {
    async fn xpub_transactions(&self, xpub: &str, page_size: u32) -> Result<Vec<UtxoTransaction>> {
        let url = self.xpub_url(xpub, page_size)?;
        debug!("Fetching xpub transactions from {}", self.base_url);

        let response = self.http.get(url).send().await.context("backend request failed")?;
        let status = response.status();
        let body = response.text().await.context("failed to read backend response")?;

        if !status.is_success() {
            return Err(SyncError::Backend {
                status: status.as_u16(),
                message: backend_error_message(&body),
            }
            .into());
        }

        parse_xpub_response(&body)
    }
}

#[derive(Deserialize)]
struct XpubResponse {
    #[serde(default)]
    transactions: Vec<WireTransaction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTransaction {
    txid: String,
    #[serde(default)]
    block_hash: Option<String>,
    #[serde(default)]
    block_height: Option<i64>,
    #[serde(default)]
    confirmations: u64,
    #[serde(default)]
    block_time: Option<u64>,
    #[serde(default)]
    vin: Vec<WireInput>,
    #[serde(default)]
    vout: Vec<WireOutput>,
}

#[derive(Deserialize)]
struct WireInput {
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    vout: Option<u32>,
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize)]
struct WireOutput {
    #[serde(default)]
    n: u32,
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    value: String,
}

impl From<WireTransaction> for UtxoTransaction {
    fn from(wire: WireTransaction) -> Self {
        // Mempool entries report height -1 (or 0) and no block hash.
        let block_height = wire.block_height.filter(|h| *h > 0).map(|h| h as u64);
        Self {
            txid: wire.txid,
            block_height,
            block_hash: wire.block_hash.filter(|h| !h.is_empty()),
            block_time: wire.block_time.filter(|t| *t > 0),
            confirmations: wire.confirmations,
            vin: wire
                .vin
                .into_iter()
                .map(|i| UtxoInput {
                    txid: i.txid,
                    vout: i.vout,
                    addresses: i.addresses,
                    value: i.value,
                })
                .collect(),
            vout: wire
                .vout
                .into_iter()
                .map(|o| UtxoOutput {
                    n: o.n,
                    addresses: o.addresses,
                    value: o.value,
                })
                .collect(),
        }
    }
}

fn parse_xpub_response(body: &str) -> Result<Vec<UtxoTransaction>> {
    let response: XpubResponse = serde_json::from_str(body).context("malformed xpub response")?;
    Ok(response.transactions.into_iter().map(UtxoTransaction::from).collect())
}

fn backend_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| body.trim().to_string())
}
