// DMPool Health Check Service
// Standalone health endpoint reading the ledger file and probing bitcoind

use anyhow::Result;
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use dmpool::config::Config;
use dmpool::health::{ComponentStatus, HealthChecker, HealthStatus};
use dmpool::node::{BitcoinRpcClient, NodeRpc};
use dmpool::store::LedgerStore;
use std::env;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
struct HealthState {
    store_path: String,
    node: Arc<dyn NodeRpc>,
    started: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {:#}", e))?;
    dmpool::logging::setup_logging(&config.logging)?;

    info!("DMPool Health Check Service starting...");

    let state = HealthState {
        store_path: config.store.path.clone(),
        node: Arc::new(BitcoinRpcClient::new(&config.bitcoinrpc)?),
        started: Instant::now(),
    };

    let port = env::var("HEALTH_PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{}", port);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("Health check service listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Reloads the ledger on each request so the report follows the daemon's writes
async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthStatus>) {
    let status = match LedgerStore::open(&state.store_path).await {
        Ok(store) => {
            let mut status = HealthChecker::new(Arc::new(store), state.node.clone())
                .check()
                .await;
            status.uptime_seconds = state.started.elapsed().as_secs();
            status
        }
        Err(e) => HealthStatus {
            status: "unhealthy".to_string(),
            ledger: ComponentStatus::unhealthy(format!("Failed to load ledger: {}", e)),
            bitcoin_rpc: ComponentStatus::unhealthy("Not checked"),
            uptime_seconds: state.started.elapsed().as_secs(),
            chain_tip: None,
            last_processed_height: None,
            pending_payouts: 0,
            escalated_payouts: 0,
            distributor_phase: None,
            memory_mb: None,
        },
    };

    let code = if status.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

async fn ready_handler() -> &'static str {
    "OK"
}
