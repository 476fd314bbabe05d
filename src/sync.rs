//! The wake-driven sync loop.

use crate::balance::BalanceBatcher;
use crate::error::SyncError;
use crate::merge::MergeEngine;
use crate::reconcile::{EvmReconciler, UtxoReconciler};
use crate::scheduler::PollingScheduler;
use crate::state::StateStore;
use crate::types::{BalanceMap, ChainFamily, Token, TransactionRecord};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const STANDBY_RECHECK: Duration = Duration::from_secs(300);

pub struct SyncService {
    store: Arc<dyn StateStore>,
    scheduler: Arc<PollingScheduler>,
    merge: Arc<MergeEngine>,
    evm: Option<EvmReconciler>,
    utxo: Option<UtxoReconciler>,
    balances: Option<BalanceBatcher>,
    tracked_tokens: Vec<Token>,
}

impl SyncService {
    pub fn new(store: Arc<dyn StateStore>, scheduler: Arc<PollingScheduler>) -> Self {
        let merge = Arc::new(MergeEngine::new(store.clone()));
        Self {
            store,
            scheduler,
            merge,
            evm: None,
            utxo: None,
            balances: None,
            tracked_tokens: Vec::new(),
        }
    }

    /// Merge engine writing to this service's store, for building a [`UtxoReconciler`].
    pub fn merge_engine(&self) -> Arc<MergeEngine> {
        self.merge.clone()
    }

    pub fn with_evm(mut self, reconciler: EvmReconciler) -> Self {
        self.evm = Some(reconciler);
        self
    }

    pub fn with_utxo(mut self, reconciler: UtxoReconciler) -> Self {
        self.utxo = Some(reconciler);
        self
    }

    /// Refresh `tokens` for the active account after every account-model tick.
    pub fn with_balances(mut self, batcher: BalanceBatcher, tokens: Vec<Token>) -> Self {
        self.balances = Some(batcher);
        self.tracked_tokens = tokens;
        self
    }

    /// One reconciliation pass for the active chain.
    ///
    /// Returns the active account's merged list when it changed.
    pub async fn tick(&self) -> Result<Option<Vec<TransactionRecord>>> {
        let chain = self.store.active_chain().await?;
        match chain.family {
            ChainFamily::Evm => {
                let Some(reconciler) = self.evm.as_ref() else {
                    debug!("Active chain {} is synced by another process", chain);
                    return Ok(None);
                };
                if reconciler.chain() != chain {
                    warn!("Active chain {} is not the configured {}, skipping", chain, reconciler.chain());
                    return Ok(None);
                }

                let fetched = reconciler.poll().await?;
                let hot = self.merge.reconcile_account_store(&fetched).await?;

                if !self.tracked_tokens.is_empty() {
                    if let Err(e) = self.refresh_balances(&self.tracked_tokens).await {
                        warn!("Balance refresh failed: {}", e);
                    }
                }
                Ok(hot)
            }
            ChainFamily::Utxo => {
                let Some(reconciler) = self.utxo.as_ref() else {
                    debug!("Active chain {} is synced by another process", chain);
                    return Ok(None);
                };
                let account = self
                    .store
                    .active_account()
                    .await?
                    .ok_or(SyncError::NoActiveAccount)?;
                let xpub = account
                    .xpub
                    .as_deref()
                    .ok_or_else(|| SyncError::MissingXpub(account.id.clone()))?;

                reconciler.poll(&account.id, xpub, chain).await
            }
        }
    }

    /// Read `tokens` for the active account and store the result.
    pub async fn refresh_balances(&self, tokens: &[Token]) -> Result<BalanceMap> {
        let batcher = self
            .balances
            .as_ref()
            .ok_or_else(|| anyhow!("no balance batcher configured"))?;
        let chain = self.store.active_chain().await?;
        if chain.family != ChainFamily::Evm {
            return Err(anyhow!("token balances are not available on {}", chain));
        }
        let account = self
            .store
            .active_account()
            .await?
            .ok_or(SyncError::NoActiveAccount)?;
        let owner = account
            .address
            .ok_or_else(|| anyhow!("account {} has no address", account.id))?;

        let balances = batcher.get_batch_token_balances(tokens, owner).await?;
        self.store.set_balances(&account.id, chain, balances.clone()).await?;
        info!("Stored {} balances for {} on {}", balances.len(), account.id, chain);
        Ok(balances)
    }

    /// Install the schedule if needed, then tick on every matching wake until the
    /// channel closes.
    ///
    /// A context that found the schedule managed elsewhere re-checks it after
    /// [`STANDBY_RECHECK`] without wakes, and takes over once it is gone.
    pub async fn run(&self, mut wake_rx: mpsc::UnboundedReceiver<String>) -> Result<()> {
        if let Err(e) = self.scheduler.ensure_installed().await {
            error!("Initial schedule install failed: {:#}", e);
        }

        loop {
            let name = match tokio::time::timeout(STANDBY_RECHECK, wake_rx.recv()).await {
                Ok(Some(name)) => name,
                Ok(None) => break,
                Err(_) => {
                    if let Err(e) = self.scheduler.ensure_installed().await {
                        warn!("Schedule check failed: {:#}", e);
                    }
                    continue;
                }
            };
            if !self.scheduler.handle_wake(&name) {
                continue;
            }

            match self.tick().await {
                Ok(Some(hot)) => info!("Tick updated {} transactions for the active account", hot.len()),
                Ok(None) => {}
                Err(e) => error!("Sync tick failed: {:#}", e),
            }

            if let Err(e) = self.scheduler.install().await {
                error!("Schedule reinstall failed: {:#}", e);
            }
        }

        info!("Wake channel closed, stopping sync loop");
        Ok(())
    }
}
