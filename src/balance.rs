//! Batched token balance reads.
//!
//! One `aggregate3` call against the chain's aggregator contract reads every
//! `balanceOf(owner)` at once with `allowFailure = true`. When that call fails (no
//! aggregator on the chain, network error, malformed response) each token is read
//! individually through a [`TaskQueue`] so public RPC endpoints are not flooded.
//! Either way every requested token appears in the result; a token whose read
//! fails reports `"0"`.

use crate::error::SyncError;
use crate::rpc::EvmRpc;
use crate::task_queue::TaskQueue;
use crate::types::{BalanceMap, Token};
use crate::utils;
use anyhow::{anyhow, Result};
use ethers::abi::{Function, Param, ParamType, StateMutability, Token as AbiToken};
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Function selector for balanceOf(address)
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// One balance read, built per batch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBalanceRequest {
    pub contract_address: Address,
    pub owner_address: Address,
    pub decimals: u8,
}

impl TokenBalanceRequest {
    fn call_data(&self) -> Bytes {
        balance_of_call_data(self.owner_address)
    }
}

/// aggregate3((address target, bool allowFailure, bytes callData)[]) returns ((bool success, bytes returnData)[])
#[allow(deprecated)]
fn aggregate3_function() -> Function {
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![ParamType::Bool, ParamType::Bytes]))),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
}

pub fn balance_of_call_data(owner: Address) -> Bytes {
    let mut data = BALANCE_OF_SELECTOR.to_vec();
    data.extend_from_slice(&ethers::abi::encode(&[AbiToken::Address(owner)]));
    Bytes::from(data)
}

/// Decode a `uint256` return value. Empty or short data reads as zero.
pub fn decode_balance(data: &[u8]) -> U256 {
    if data.len() < 32 {
        return U256::zero();
    }
    U256::from_big_endian(&data[..32])
}

pub fn encode_aggregate3(requests: &[TokenBalanceRequest]) -> Result<Bytes> {
    let calls = requests
        .iter()
        .map(|r| {
            AbiToken::Tuple(vec![
                AbiToken::Address(r.contract_address),
                AbiToken::Bool(true),
                AbiToken::Bytes(r.call_data().to_vec()),
            ])
        })
        .collect();
    let data = aggregate3_function().encode_input(&[AbiToken::Array(calls)])?;
    Ok(Bytes::from(data))
}

/// Decode an `aggregate3` response into `(success, returnData)` pairs.
pub fn decode_aggregate3(data: &[u8]) -> Result<Vec<(bool, Vec<u8>)>> {
    let mut outputs = aggregate3_function().decode_output(data)?;
    let Some(AbiToken::Array(items)) = outputs.pop() else {
        return Err(anyhow!("aggregate3 returned an unexpected shape"));
    };
    items
        .into_iter()
        .map(|item| match item {
            AbiToken::Tuple(mut fields) if fields.len() == 2 => {
                let data = fields.pop();
                let success = fields.pop();
                match (success, data) {
                    (Some(AbiToken::Bool(success)), Some(AbiToken::Bytes(bytes))) => Ok((success, bytes)),
                    _ => Err(anyhow!("Invalid tuple format in aggregate3 response")),
                }
            }
            _ => Err(anyhow!("Invalid tuple in aggregate3 response")),
        })
        .collect()
}

/// Fetches balances for a set of tokens in as few round trips as the chain allows.
pub struct BalanceBatcher {
    rpc: Arc<dyn EvmRpc>,
    chain_id: u64,
    aggregator: Option<Address>,
    fallback_pool: usize,
    group_pause: Duration,
}

impl BalanceBatcher {
    pub fn new(rpc: Arc<dyn EvmRpc>, chain_id: u64, aggregator: Option<Address>) -> Self {
        Self {
            rpc,
            chain_id,
            aggregator,
            fallback_pool: 3,
            group_pause: Duration::from_millis(100),
        }
    }

    /// Tune the per-token fallback: concurrency and the pause added per group of `pool` calls.
    pub fn with_fallback(mut self, pool: usize, group_pause: Duration) -> Self {
        self.fallback_pool = pool;
        self.group_pause = group_pause;
        self
    }

    /// Balance of every token for `owner`, keyed by lowercase contract address.
    pub async fn get_batch_token_balances(&self, tokens: &[Token], owner: Address) -> Result<BalanceMap> {
        if tokens.is_empty() {
            return Ok(BalanceMap::new());
        }

        let requests: Vec<TokenBalanceRequest> = tokens
            .iter()
            .map(|t| TokenBalanceRequest {
                contract_address: t.address,
                owner_address: owner,
                decimals: t.decimals,
            })
            .collect();

        match self.fetch_aggregated(&requests).await {
            Ok(balances) => Ok(balances),
            Err(e) => {
                warn!(
                    "Aggregated balance read failed on chain {} ({}), falling back to {} individual calls",
                    self.chain_id,
                    e,
                    requests.len()
                );
                self.fetch_individually(&requests).await
            }
        }
    }

    async fn fetch_aggregated(&self, requests: &[TokenBalanceRequest]) -> Result<BalanceMap> {
        let aggregator = self
            .aggregator
            .ok_or(SyncError::AggregatorUnavailable(self.chain_id))?;

        let call_data = encode_aggregate3(requests)?;
        let response = self.rpc.call(aggregator, call_data).await?;
        let results = decode_aggregate3(&response)?;

        if results.len() != requests.len() {
            return Err(anyhow!(
                "aggregate3 returned {} results for {} calls",
                results.len(),
                requests.len()
            ));
        }

        let mut balances = BalanceMap::new();
        for (request, (success, data)) in requests.iter().zip(results) {
            let balance = if success {
                decode_balance(&data)
            } else {
                debug!("balanceOf reverted for {:?}", request.contract_address);
                U256::zero()
            };
            balances.insert(
                utils::address_key(&request.contract_address),
                utils::format_token_amount(balance, request.decimals),
            );
        }

        info!("Fetched {} token balances in one aggregated call", balances.len());
        Ok(balances)
    }

    async fn fetch_individually(&self, requests: &[TokenBalanceRequest]) -> Result<BalanceMap> {
        let queue = TaskQueue::new(self.fallback_pool)?;

        for (position, request) in requests.iter().copied().enumerate() {
            let rpc = Arc::clone(&self.rpc);
            let delay = self.group_pause * (position / self.fallback_pool) as u32;
            queue.execute(move || async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let data = rpc.call(request.contract_address, request.call_data()).await?;
                Ok(decode_balance(&data))
            });
        }

        let results = queue.done().await;
        let mut balances = BalanceMap::new();
        let mut failed = 0;
        for (request, result) in requests.iter().zip(results) {
            let balance = match result.result {
                Some(balance) => balance,
                None => {
                    failed += 1;
                    if let Some(e) = result.error {
                        warn!("balanceOf failed for {:?}: {}", request.contract_address, e);
                    }
                    U256::zero()
                }
            };
            balances.insert(
                utils::address_key(&request.contract_address),
                utils::format_token_amount(balance, request.decimals),
            );
        }

        info!(
            "Fetched {} token balances individually ({} failed)",
            balances.len(),
            failed
        );
        Ok(balances)
    }
}
