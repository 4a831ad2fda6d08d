// Health check module for DMPool
// Health monitoring of the ledger store, bitcoind RPC and background tasks

use crate::distributor::{DistributorPhase, RewardDistributor};
use crate::node::NodeRpc;
use crate::payout::PayoutStatus;
use crate::store::{LEDGER_FILE, LedgerStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const RPC_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health check response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub ledger: ComponentStatus,
    pub bitcoin_rpc: ComponentStatus,
    pub uptime_seconds: u64,
    pub chain_tip: Option<u64>,
    pub last_processed_height: Option<u64>,
    pub pending_payouts: u64,
    pub escalated_payouts: u64,
    pub distributor_phase: Option<DistributorPhase>,
    pub memory_mb: Option<u64>,
}

/// Individual component status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub status: String,
    pub message: String,
    pub latency_ms: Option<u64>,
}

impl ComponentStatus {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            message: "OK".to_string(),
            latency_ms: None,
        }
    }

    fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: "degraded".to_string(),
            message: message.into(),
            latency_ms: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: message.into(),
            latency_ms: None,
        }
    }

    fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = msg.into();
        self
    }

    fn is(&self, status: &str) -> bool {
        self.status == status
    }
}

/// Health checker over the engine's store and node connection
pub struct HealthChecker {
    start_time: Instant,
    store: Arc<LedgerStore>,
    node: Arc<dyn NodeRpc>,
    distributor: Option<Arc<RewardDistributor>>,
}

impl HealthChecker {
    pub fn new(store: Arc<LedgerStore>, node: Arc<dyn NodeRpc>) -> Self {
        Self {
            start_time: Instant::now(),
            store,
            node,
            distributor: None,
        }
    }

    pub fn with_distributor(mut self, distributor: Arc<RewardDistributor>) -> Self {
        self.distributor = Some(distributor);
        self
    }

    /// Perform comprehensive health check
    pub async fn check(&self) -> HealthStatus {
        let ledger_status = self.check_ledger().await;
        let (rpc_status, chain_tip) = self.check_bitcoin_rpc().await;

        // Reads keep working without the node, so a node outage only degrades
        let overall_status = if ledger_status.is("unhealthy") {
            "unhealthy"
        } else if ledger_status.is("healthy") && rpc_status.is("healthy") {
            "healthy"
        } else {
            "degraded"
        };

        let (last_processed_height, pending_payouts, escalated_payouts) = self
            .store
            .read(|state| {
                let pending = state
                    .payouts
                    .values()
                    .filter(|p| p.status == PayoutStatus::Pending)
                    .count() as u64;
                let escalated = state.payouts.values().filter(|p| p.escalated).count() as u64;
                (state.cursor.last_processed_height, pending, escalated)
            })
            .await;

        HealthStatus {
            status: overall_status.to_string(),
            ledger: ledger_status,
            bitcoin_rpc: rpc_status,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            chain_tip,
            last_processed_height,
            pending_payouts,
            escalated_payouts,
            distributor_phase: self.distributor.as_ref().map(|d| d.phase()),
            memory_mb: self.get_memory_usage(),
        }
    }

    /// Check the ledger is loaded and its directory is reachable
    async fn check_ledger(&self) -> ComponentStatus {
        let start = Instant::now();
        let (balances, payouts) = self
            .store
            .read(|state| (state.balances.len(), state.payouts.len()))
            .await;

        let Some(dir) = self.store.dir() else {
            return ComponentStatus::healthy()
                .with_latency(start.elapsed().as_millis() as u64)
                .with_message("In-memory ledger");
        };

        match tokio::fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {
                let message = if dir.join(LEDGER_FILE).exists() {
                    format!("{} balances, {} payouts", balances, payouts)
                } else {
                    "Ledger not yet written".to_string()
                };
                ComponentStatus::healthy()
                    .with_latency(start.elapsed().as_millis() as u64)
                    .with_message(message)
            }
            Ok(_) => ComponentStatus::unhealthy(format!("{} is not a directory", dir.display())),
            Err(e) => ComponentStatus::unhealthy(format!("Ledger directory error: {}", e))
                .with_latency(start.elapsed().as_millis() as u64),
        }
    }

    /// Check Bitcoin RPC connectivity
    async fn check_bitcoin_rpc(&self) -> (ComponentStatus, Option<u64>) {
        let start = Instant::now();

        match timeout(RPC_CHECK_TIMEOUT, self.node.get_blockchain_info()).await {
            Ok(Ok(info)) => {
                let latency = start.elapsed().as_millis() as u64;
                let status = if info.initial_block_download {
                    ComponentStatus::degraded(format!(
                        "Node in initial block download at height {}",
                        info.blocks
                    ))
                } else {
                    ComponentStatus::healthy()
                        .with_message(format!("{} at height {}", info.chain, info.blocks))
                };
                (status.with_latency(latency), Some(info.blocks))
            }
            Ok(Err(e)) => (
                ComponentStatus::unhealthy(format!("RPC failed: {}", e))
                    .with_latency(start.elapsed().as_millis() as u64),
                None,
            ),
            Err(_) => (
                ComponentStatus::unhealthy("RPC timeout (5s)")
                    .with_latency(RPC_CHECK_TIMEOUT.as_millis() as u64),
                None,
            ),
        }
    }

    /// Get current process memory usage in MB
    fn get_memory_usage(&self) -> Option<u64> {
        #[cfg(unix)]
        {
            let content = std::fs::read_to_string("/proc/self/status").ok()?;
            let line = content.lines().find(|l| l.starts_with("VmRSS:"))?;
            let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
            Some(kb / 1024)
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}
