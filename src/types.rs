//! Common types shared across modules.

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lowercase contract address -> decimal-formatted balance.
pub type BalanceMap = BTreeMap<String, String>;

/// Chain family, decides which reconciler and which polling cadence applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    /// Account-model chains (EVM)
    Evm,
    /// UTXO chains queried through an xpub indexer
    Utxo,
}

impl ChainFamily {
    pub fn label(&self) -> &'static str {
        match self {
            ChainFamily::Evm => "evm",
            ChainFamily::Utxo => "utxo",
        }
    }
}

/// A chain within a family. UTXO chains use their SLIP-44 coin type as id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainKey {
    pub family: ChainFamily,
    pub chain_id: u64,
}

impl ChainKey {
    pub const fn evm(chain_id: u64) -> Self {
        Self { family: ChainFamily::Evm, chain_id }
    }

    pub const fn utxo(coin_type: u64) -> Self {
        Self { family: ChainFamily::Utxo, chain_id: coin_type }
    }

    /// Key used for the JSON document layout, e.g. `evm:1`.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family.label(), self.chain_id)
    }
}

/// A wallet account known to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Keyring the account belongs to (e.g. "hd", "ledger", "imported")
    pub keyring: String,
    #[serde(default)]
    pub name: String,
    /// Account-model address, if this account has one
    #[serde(default)]
    pub address: Option<Address>,
    /// Extended public key for UTXO chains
    #[serde(default)]
    pub xpub: Option<String>,
}

impl Account {
    pub fn new(id: impl Into<String>, keyring: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            keyring: keyring.into(),
            name: String::new(),
            address: None,
            xpub: None,
        }
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_xpub(mut self, xpub: impl Into<String>) -> Self {
        self.xpub = Some(xpub.into());
        self
    }
}

/// ERC-20 style token tracked for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub decimals: u8,
}

/// Latest block reference published after each account-model scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: Option<H256>,
    pub timestamp: u64,
    pub gas_limit: U256,
    pub base_fee_per_gas: Option<U256>,
}

/// Transaction on an account-model chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmTransaction {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub block_number: Option<u64>,
    pub block_hash: Option<H256>,
    pub confirmations: u64,
    pub chain_id: u64,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

impl EvmTransaction {
    pub fn key(&self) -> String {
        format!("{:#x}", self.hash)
    }

    pub fn touches(&self, address: &Address) -> bool {
        self.from == *address || self.to.as_ref() == Some(address)
    }

    pub fn is_mined(&self) -> bool {
        self.block_hash.is_some() && self.block_number.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoInput {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoOutput {
    pub n: u32,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub value: String,
}

/// Transaction on a UTXO chain, as reported by the indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoTransaction {
    pub txid: String,
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
    pub block_time: Option<u64>,
    pub confirmations: u64,
    #[serde(default)]
    pub vin: Vec<UtxoInput>,
    #[serde(default)]
    pub vout: Vec<UtxoOutput>,
}

impl UtxoTransaction {
    pub fn key(&self) -> String {
        self.txid.to_ascii_lowercase()
    }
}

/// Stored transaction, tagged by chain family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum TransactionRecord {
    Evm(EvmTransaction),
    Utxo(UtxoTransaction),
}

impl TransactionRecord {
    /// Identity key, case-insensitive (always lowercase).
    pub fn key(&self) -> String {
        match self {
            TransactionRecord::Evm(tx) => tx.key(),
            TransactionRecord::Utxo(tx) => tx.key(),
        }
    }

    pub fn confirmations(&self) -> u64 {
        match self {
            TransactionRecord::Evm(tx) => tx.confirmations,
            TransactionRecord::Utxo(tx) => tx.confirmations,
        }
    }

    pub fn chain_family(&self) -> ChainFamily {
        match self {
            TransactionRecord::Evm(_) => ChainFamily::Evm,
            TransactionRecord::Utxo(_) => ChainFamily::Utxo,
        }
    }

    /// Unconfirmed or not yet mined.
    pub fn is_pending(&self) -> bool {
        match self {
            TransactionRecord::Evm(tx) => tx.confirmations == 0 || !tx.is_mined(),
            TransactionRecord::Utxo(tx) => tx.confirmations == 0 || tx.block_height.is_none(),
        }
    }

    pub fn as_evm(&self) -> Option<&EvmTransaction> {
        match self {
            TransactionRecord::Evm(tx) => Some(tx),
            TransactionRecord::Utxo(_) => None,
        }
    }

    pub fn as_utxo(&self) -> Option<&UtxoTransaction> {
        match self {
            TransactionRecord::Utxo(tx) => Some(tx),
            TransactionRecord::Evm(_) => None,
        }
    }
}

impl From<EvmTransaction> for TransactionRecord {
    fn from(tx: EvmTransaction) -> Self {
        TransactionRecord::Evm(tx)
    }
}

impl From<UtxoTransaction> for TransactionRecord {
    fn from(tx: UtxoTransaction) -> Self {
        TransactionRecord::Utxo(tx)
    }
}
