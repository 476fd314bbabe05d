//! In-memory fakes of the network seams, shared by unit tests.

use crate::rpc::{EvmRpc, UtxoBackend};
use crate::types::UtxoTransaction;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{Address, Block, Bytes, Transaction, H256, U256, U64};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type CallHandler = Box<dyn Fn(Address, &Bytes) -> Result<Bytes> + Send + Sync>;

pub struct FakeEvmRpc {
    pub latest: Mutex<u64>,
    pub blocks: Mutex<HashMap<u64, Block<Transaction>>>,
    pub transactions: Mutex<HashMap<H256, Transaction>>,
    pub block_batches: Mutex<Vec<Vec<u64>>>,
    pub fail_blocks: AtomicBool,
    call_handler: CallHandler,
    call_delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl FakeEvmRpc {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(0),
            blocks: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            block_batches: Mutex::new(Vec::new()),
            fail_blocks: AtomicBool::new(false),
            call_handler: Box::new(|_, _| Err(anyhow!("eth_call not scripted"))),
            call_delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_call_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Address, &Bytes) -> Result<Bytes> + Send + Sync + 'static,
    {
        self.call_handler = Box::new(handler);
        self
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn set_latest(&self, number: u64) {
        *self.latest.lock().unwrap() = number;
    }

    pub fn add_block(&self, block: Block<Transaction>) {
        let number = block.number.map(|n| n.as_u64()).unwrap_or_default();
        for tx in &block.transactions {
            self.transactions.lock().unwrap().insert(tx.hash, tx.clone());
        }
        self.blocks.lock().unwrap().insert(number, block);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvmRpc for FakeEvmRpc {
    async fn block_number(&self) -> Result<u64> {
        Ok(*self.latest.lock().unwrap())
    }

    async fn get_blocks_with_txs(&self, numbers: &[u64]) -> Result<Vec<Option<Block<Transaction>>>> {
        self.block_batches.lock().unwrap().push(numbers.to_vec());
        if self.fail_blocks.load(Ordering::SeqCst) {
            return Err(anyhow!("block batch failed"));
        }
        let blocks = self.blocks.lock().unwrap();
        Ok(numbers.iter().map(|n| blocks.get(n).cloned()).collect())
    }

    async fn get_block(&self, number: u64) -> Result<Option<Block<H256>>> {
        let blocks = self.blocks.lock().unwrap();
        Ok(blocks.get(&number).map(|b| Block {
            number: b.number,
            hash: b.hash,
            timestamp: b.timestamp,
            transactions: b.transactions.iter().map(|t| t.hash).collect(),
            ..Default::default()
        }))
    }

    async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>> {
        Ok(self.transactions.lock().unwrap().get(&hash).cloned())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        let result = (self.call_handler)(to, &data);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn block(number: u64, timestamp: u64, txs: Vec<Transaction>) -> Block<Transaction> {
    let hash = H256::from_low_u64_be(0xb000 + number);
    let transactions = txs
        .into_iter()
        .map(|mut tx| {
            tx.block_number = Some(U64::from(number));
            tx.block_hash = Some(hash);
            tx
        })
        .collect();
    Block {
        number: Some(U64::from(number)),
        hash: Some(hash),
        timestamp: U256::from(timestamp),
        gas_limit: U256::from(30_000_000u64),
        base_fee_per_gas: Some(U256::from(7u64)),
        transactions,
        ..Default::default()
    }
}

pub fn transfer(hash: u64, from: Address, to: Option<Address>) -> Transaction {
    Transaction {
        hash: H256::from_low_u64_be(hash),
        from,
        to,
        ..Default::default()
    }
}

pub struct FakeUtxoBackend {
    pub responses: Mutex<Vec<Result<Vec<UtxoTransaction>>>>,
    pub requests: Mutex<Vec<(String, u32)>>,
}

impl FakeUtxoBackend {
    /// Responses are handed out in order, the last one repeats.
    pub fn new(responses: Vec<Result<Vec<UtxoTransaction>>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UtxoBackend for FakeUtxoBackend {
    async fn xpub_transactions(&self, xpub: &str, page_size: u32) -> Result<Vec<UtxoTransaction>> {
        self.requests.lock().unwrap().push((xpub.to_string(), page_size));
        let mut responses = self.responses.lock().unwrap();
        match responses.len() {
            0 => Ok(Vec::new()),
            1 => match &responses[0] {
                Ok(txs) => Ok(txs.clone()),
                Err(e) => Err(anyhow!("{}", e)),
            },
            _ => responses.remove(0),
        }
    }
}

pub fn utxo_tx(txid: &str, height: Option<u64>, confirmations: u64, block_time: Option<u64>) -> UtxoTransaction {
    UtxoTransaction {
        txid: txid.to_string(),
        block_height: height,
        block_hash: height.map(|h| format!("{:064x}", h)),
        block_time,
        confirmations,
        vin: vec![],
        vout: vec![],
    }
}
