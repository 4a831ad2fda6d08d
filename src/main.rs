// DMPool reward engine daemon
// Runs the distributor, payout runner, confirmation tracker and the API

use anyhow::Context;
use clap::Parser;
use dmpool::alert::AlertManager;
use dmpool::api::{ApiState, start_api_server};
use dmpool::auth::Authorizer;
use dmpool::backup::BackupManager;
use dmpool::config::Config;
use dmpool::confirmation::{ConfirmationSettings, ConfirmationTracker};
use dmpool::distributor::{DistributorSettings, RewardDistributor};
use dmpool::health::HealthChecker;
use dmpool::ledger::Ledger;
use dmpool::logging::setup_logging;
use dmpool::node::{BitcoinRpcClient, NodeRpc};
use dmpool::payout::{PayoutManager, PayoutSettings};
use dmpool::scheduler::{Schedule, spawn_all};
use dmpool::shares::{PgShareStore, ShareStore, ShareWindowTracker};
use dmpool::store::LedgerStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, env("DMPOOL_CONFIG"), default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = setup_logging(&config.logging) {
        eprintln!("Failed to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("DMPool stopped with error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        "Starting DMPool reward engine v{} on {} network",
        env!("CARGO_PKG_VERSION"),
        config.network
    );

    let store = Arc::new(
        LedgerStore::open(&config.store.path)
            .await
            .context("Failed to open ledger store")?,
    );
    let node: Arc<dyn NodeRpc> = Arc::new(
        BitcoinRpcClient::new(&config.bitcoinrpc).context("Failed to create RPC client")?,
    );
    let shares: Arc<dyn ShareStore> =
        Arc::new(PgShareStore::connect(&config.shares).context("Failed to open share database")?);
    let alerts = Arc::new(AlertManager::from_config(&config.alerts).context("Failed to set up alerts")?);

    let distributor = Arc::new(RewardDistributor::new(
        store.clone(),
        node.clone(),
        ShareWindowTracker::new(shares),
        DistributorSettings::from(&config),
    ));
    let payouts = Arc::new(PayoutManager::new(
        store.clone(),
        node.clone(),
        alerts.clone(),
        PayoutSettings::from(&config),
    ));
    let tracker = Arc::new(ConfirmationTracker::new(
        store.clone(),
        node.clone(),
        alerts,
        ConfirmationSettings::from(&config),
    ));

    let backups = match &config.backup.dir {
        Some(dir) => Some(Arc::new(
            BackupManager::new(
                PathBuf::from(&config.store.path),
                PathBuf::from(dir),
                config.backup.max_backups,
            )?
            .with_store(store.clone()),
        )),
        None => None,
    };

    let schedule = Schedule {
        distributor: config.distributor_poll_interval(),
        payouts: config
            .payout
            .auto_payout_enabled
            .then(|| config.payout_interval()),
        confirmations: config.confirmation_poll_interval(),
        backups: (config.backup.interval_hours > 0)
            .then(|| Duration::from_secs(config.backup.interval_hours * 3600)),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = spawn_all(
        &schedule,
        distributor.clone(),
        payouts.clone(),
        tracker,
        backups,
        shutdown_rx.clone(),
    );

    let health = Arc::new(HealthChecker::new(store.clone(), node).with_distributor(distributor));
    let api_state = Arc::new(ApiState {
        store: store.clone(),
        ledger: Ledger::new(store),
        payouts,
        authorizer: Arc::new(Authorizer::new(&config.api.jwt_secret)),
        health,
        stuck_grace: config.payout.pending_grace(),
    });
    match start_api_server(&config.api, api_state, shutdown_rx).await {
        Ok(handle) => handles.push(handle),
        Err(e) => {
            let _ = shutdown_tx.send(true);
            return Err(e).context("Failed to start API server");
        }
    }

    wait_for_signal().await;
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    info!("DMPool stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received ctrl-c"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received ctrl-c");
}
