//! Shared state access.
//!
//! The sync engine never touches a global store. It reads the active account,
//! the active chain and the stored transaction lists through [`StateStore`], and
//! writes merged lists, balances and the latest block header back through it.

use crate::shared_file::SharedJsonFile;
use crate::types::{Account, BalanceMap, BlockHeader, ChainKey, TransactionRecord};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn active_account(&self) -> Result<Option<Account>>;

    async fn active_chain(&self) -> Result<ChainKey>;

    /// Every known account, across all keyrings.
    async fn accounts(&self) -> Result<Vec<Account>>;

    /// Whether a UI surface (popup, tab) is currently open.
    async fn ui_open(&self) -> Result<bool>;

    async fn transactions(&self, account_id: &str, chain: ChainKey) -> Result<Vec<TransactionRecord>>;

    /// Replace the list for one (account, chain). Other chains are left untouched.
    async fn set_transactions(
        &self,
        account_id: &str,
        chain: ChainKey,
        transactions: Vec<TransactionRecord>,
    ) -> Result<()>;

    async fn set_current_block(&self, chain: ChainKey, header: BlockHeader) -> Result<()>;

    /// Replace the balances for one (account, chain).
    async fn set_balances(&self, account_id: &str, chain: ChainKey, balances: BalanceMap) -> Result<()>;
}

/// The whole state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub active_account_id: Option<String>,
    pub active_chain: ChainKey,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub ui_open: bool,
    /// account id -> chain key -> transactions
    #[serde(default)]
    pub transactions: BTreeMap<String, BTreeMap<String, Vec<TransactionRecord>>>,
    /// chain key -> latest scanned block
    #[serde(default)]
    pub current_blocks: BTreeMap<String, BlockHeader>,
    /// account id -> chain key -> balances
    #[serde(default)]
    pub balances: BTreeMap<String, BTreeMap<String, BalanceMap>>,
}

impl SyncState {
    pub fn new(active_chain: ChainKey) -> Self {
        Self {
            active_account_id: None,
            active_chain,
            accounts: Vec::new(),
            ui_open: false,
            transactions: BTreeMap::new(),
            current_blocks: BTreeMap::new(),
            balances: BTreeMap::new(),
        }
    }

    /// Add or replace an account by id.
    pub fn upsert_account(&mut self, account: Account) {
        if let Some(existing) = self.accounts.iter_mut().find(|a| a.id == account.id) {
            *existing = account;
        } else {
            self.accounts.push(account);
        }
    }

    pub fn active_account(&self) -> Option<&Account> {
        let id = self.active_account_id.as_deref()?;
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn transactions_for(&self, account_id: &str, chain: ChainKey) -> &[TransactionRecord] {
        self.transactions
            .get(account_id)
            .and_then(|chains| chains.get(&chain.storage_key()))
            .map(|txs| txs.as_slice())
            .unwrap_or(&[])
    }

    pub fn current_block(&self, chain: ChainKey) -> Option<&BlockHeader> {
        self.current_blocks.get(&chain.storage_key())
    }

    pub fn balances_for(&self, account_id: &str, chain: ChainKey) -> Option<&BalanceMap> {
        self.balances
            .get(account_id)
            .and_then(|chains| chains.get(&chain.storage_key()))
    }
}

/// In-memory store for a single process.
pub struct MemoryStateStore {
    state: RwLock<SyncState>,
}

impl MemoryStateStore {
    pub fn new(state: SyncState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Host-side mutation (account switch, UI open/close, ...).
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncState),
    {
        let mut state = self.state.write().await;
        f(&mut state);
    }

    pub async fn snapshot(&self) -> SyncState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn active_account(&self) -> Result<Option<Account>> {
        Ok(self.state.read().await.active_account().cloned())
    }

    async fn active_chain(&self) -> Result<ChainKey> {
        Ok(self.state.read().await.active_chain)
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        Ok(self.state.read().await.accounts.clone())
    }

    async fn ui_open(&self) -> Result<bool> {
        Ok(self.state.read().await.ui_open)
    }

    async fn transactions(&self, account_id: &str, chain: ChainKey) -> Result<Vec<TransactionRecord>> {
        Ok(self.state.read().await.transactions_for(account_id, chain).to_vec())
    }

    async fn set_transactions(
        &self,
        account_id: &str,
        chain: ChainKey,
        transactions: Vec<TransactionRecord>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .transactions
            .entry(account_id.to_string())
            .or_default()
            .insert(chain.storage_key(), transactions);
        Ok(())
    }

    async fn set_current_block(&self, chain: ChainKey, header: BlockHeader) -> Result<()> {
        let mut state = self.state.write().await;
        state.current_blocks.insert(chain.storage_key(), header);
        Ok(())
    }

    async fn set_balances(&self, account_id: &str, chain: ChainKey, balances: BalanceMap) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .balances
            .entry(account_id.to_string())
            .or_default()
            .insert(chain.storage_key(), balances);
        Ok(())
    }
}

/// JSON document on disk, shared with other processes.
///
/// Every read goes to the file, so changes made by the host or by a daemon for
/// another chain family are seen on the next call. Every write is a locked
/// reload, change and replace of the whole document.
pub struct FileStateStore {
    file: SharedJsonFile,
    default_chain: ChainKey,
}

impl FileStateStore {
    /// Open the document at `path`, starting from an empty state on `default_chain`
    /// when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>, default_chain: ChainKey) -> Result<Self> {
        let store = Self {
            file: SharedJsonFile::new(path),
            default_chain,
        };
        if store.file.read::<SyncState>()?.is_some() {
            info!("Loaded sync state from {:?}", store.path());
        }
        Ok(store)
    }

    /// Timing of the write lock shared with other processes.
    pub fn with_lock_timing(mut self, ttl: Duration, wait_timeout: Duration) -> Self {
        self.file = self.file.with_lock_timing(ttl, wait_timeout);
        self
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut SyncState) + Send,
    {
        let default_chain = self.default_chain;
        self.file.update(move || SyncState::new(default_chain), f).await
    }

    /// The document as currently stored.
    pub fn snapshot(&self) -> Result<SyncState> {
        Ok(self
            .file
            .read()?
            .unwrap_or_else(|| SyncState::new(self.default_chain)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn active_account(&self) -> Result<Option<Account>> {
        Ok(self.snapshot()?.active_account().cloned())
    }

    async fn active_chain(&self) -> Result<ChainKey> {
        Ok(self.snapshot()?.active_chain)
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        Ok(self.snapshot()?.accounts)
    }

    async fn ui_open(&self) -> Result<bool> {
        Ok(self.snapshot()?.ui_open)
    }

    async fn transactions(&self, account_id: &str, chain: ChainKey) -> Result<Vec<TransactionRecord>> {
        Ok(self.snapshot()?.transactions_for(account_id, chain).to_vec())
    }

    async fn set_transactions(
        &self,
        account_id: &str,
        chain: ChainKey,
        transactions: Vec<TransactionRecord>,
    ) -> Result<()> {
        self.update(move |state| {
            state
                .transactions
                .entry(account_id.to_string())
                .or_default()
                .insert(chain.storage_key(), transactions);
        })
        .await
    }

    async fn set_current_block(&self, chain: ChainKey, header: BlockHeader) -> Result<()> {
        self.update(move |state| {
            state.current_blocks.insert(chain.storage_key(), header);
        })
        .await
    }

    async fn set_balances(&self, account_id: &str, chain: ChainKey, balances: BalanceMap) -> Result<()> {
        self.update(move |state| {
            state
                .balances
                .entry(account_id.to_string())
                .or_default()
                .insert(chain.storage_key(), balances);
        })
        .await
    }
}
