// Common test utilities for DMPool integration tests

#![allow(dead_code)]

use bitcoin::{Amount, Network};
use chrono::{DateTime, TimeDelta, Utc};
use dmpool::alert::{AlertManager, LogAlertSink};
use dmpool::confirmation::{ConfirmationSettings, ConfirmationTracker};
use dmpool::distributor::{DistributorSettings, RewardDistributor};
use dmpool::payout::{PayoutManager, PayoutSettings};
use dmpool::shares::{MemoryShareStore, Share, ShareWindowTracker};
use dmpool::store::LedgerStore;
use dmpool::test_utils::{CHANGE_ADDRESS, FakeNode, POOL_ADDRESS};
use std::path::Path;
use std::sync::Arc;

pub const MATURITY: u64 = 3;
pub const BLOCK_REWARD: u64 = 625_000_000;

/// Every engine component over one ledger directory
pub struct Engine {
    pub store: Arc<LedgerStore>,
    pub alerts: Arc<AlertManager>,
    pub distributor: RewardDistributor,
    pub payouts: PayoutManager,
    pub tracker: ConfirmationTracker,
}

impl Engine {
    /// Open (or reopen after a simulated crash) the engine over `dir`
    pub async fn open(dir: &Path, node: Arc<FakeNode>, shares: Arc<MemoryShareStore>) -> Self {
        let store = Arc::new(LedgerStore::open(dir).await.unwrap());
        let alerts = Arc::new(AlertManager::new(Arc::new(LogAlertSink)));

        let distributor = RewardDistributor::new(
            store.clone(),
            node.clone(),
            ShareWindowTracker::new(shares),
            DistributorSettings {
                pool_addresses: vec![POOL_ADDRESS.to_string()],
                maturity_confirmations: MATURITY,
                start_height: 0,
                max_blocks_per_run: 500,
                ttl: TimeDelta::days(7),
                pool_fee_bps: 100,
            },
        );
        let payouts = PayoutManager::new(
            store.clone(),
            node.clone(),
            alerts.clone(),
            PayoutSettings {
                network: Network::Regtest,
                min_payout_satoshis: 10_000,
                change_address: CHANGE_ADDRESS.to_string(),
                min_utxo_confirmations: 1,
                fee_conf_target: 6,
                fallback_fee_sat_per_vb: 1,
                max_fee_satoshis: 100_000,
                max_broadcast_attempts: 3,
            },
        );
        let tracker = ConfirmationTracker::new(
            store.clone(),
            node,
            alerts.clone(),
            ConfirmationSettings {
                threshold: 6,
                missing_checks_before_failure: 3,
            },
        );

        Self {
            store,
            alerts,
            distributor,
            payouts,
            tracker,
        }
    }

    pub async fn balance(&self, address: &str) -> u64 {
        self.store.read(|s| s.balance_of(address)).await
    }
}

pub async fn add_share(shares: &MemoryShareStore, miner: &str, difficulty: u64, at: DateTime<Utc>) {
    shares
        .add_share(Share {
            miner_address: miner.to_string(),
            worker_name: "rig01".to_string(),
            difficulty,
            timestamp: at,
        })
        .await;
}

/// On a fresh node, mine a pool block at height 1 and bury it until it matures
pub fn mine_matured_pool_block(node: &FakeNode, block_time: DateTime<Utc>) -> u64 {
    node.mine_block(None, block_time);
    node.mine_block(Some((POOL_ADDRESS, Amount::from_sat(BLOCK_REWARD))), block_time);
    for _ in 1..MATURITY {
        node.mine_block(None, block_time);
    }
    1
}
