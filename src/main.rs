use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use walletsync::alarm::TokioAlarmHost;
use walletsync::balance::BalanceBatcher;
use walletsync::config::{app_data_dir, Config};
use walletsync::lock::FileLocks;
use walletsync::reconcile::{EvmReconciler, UtxoReconciler};
use walletsync::rpc::{BlockbookClient, EvmRpc};
use walletsync::scheduler::{PollingScheduler, DEFAULT_ALARM_NAME};
use walletsync::state::{FileStateStore, StateStore};
use walletsync::sync::SyncService;
use walletsync::sync_settings::SyncSettings;
use walletsync::ChainFamily;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let settings = SyncSettings::load();
    let chain = config.chain;
    info!("Starting walletsync on {} ({}) via {}", config.network_label(), chain, config.endpoint);

    let store = Arc::new(
        FileStateStore::open(&config.state_file, chain)?
            .with_lock_timing(settings.lock_ttl(), settings.lock_wait_timeout()),
    );
    let active = store.active_chain().await?;
    if active != chain {
        warn!("Active chain in {:?} is {}, idle until {} is selected", store.path(), active, chain);
    }

    let (alarms, wake_rx) = TokioAlarmHost::new();
    let alarms = alarms.with_registry(app_data_dir().join("alarms.json"));
    let locks = FileLocks::new(
        app_data_dir().join("locks"),
        settings.lock_ttl(),
        settings.lock_wait_timeout(),
    );
    let scheduler = Arc::new(
        PollingScheduler::new(Arc::new(alarms), Arc::new(locks), store.clone(), settings.clone())
            .with_alarm_name(format!("{}.{}", DEFAULT_ALARM_NAME, chain.storage_key())),
    );

    let mut service = SyncService::new(store.clone(), scheduler.clone());
    match chain.family {
        ChainFamily::Evm => {
            let rpc: Arc<dyn EvmRpc> = config.get_provider().await?;
            let reconciler = EvmReconciler::new(rpc.clone(), store.clone(), chain.chain_id)
                .with_lookback(settings.lookback_blocks)
                .with_backfill_pool(settings.fallback_pool_size);
            let batcher = BalanceBatcher::new(rpc, chain.chain_id, config.aggregator_address())
                .with_fallback(settings.fallback_pool_size, settings.fallback_group_pause());
            let tokens = settings.tokens_for(chain.chain_id).to_vec();
            info!("Tracking {} tokens", tokens.len());
            service = service.with_evm(reconciler).with_balances(batcher, tokens);
        }
        ChainFamily::Utxo => {
            let backend = Arc::new(BlockbookClient::new(&config.endpoint)?);
            let reconciler =
                UtxoReconciler::new(backend, service.merge_engine()).with_page_size(settings.utxo_page_size);
            service = service.with_utxo(reconciler);
        }
    }

    // First pass right away instead of one full period from now.
    scheduler.wake_after(Duration::ZERO).await?;

    tokio::select! {
        result = service.run(wake_rx) => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
    }

    Ok(())
}
