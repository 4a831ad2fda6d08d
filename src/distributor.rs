// Reward distributor for DMPool
// Detects matured pool blocks and credits the PPLNS split exactly once per block

use crate::config::Config;
use crate::error::DistributorError;
use crate::node::NodeRpc;
use crate::shares::{PplnsWindow, ShareWindowTracker};
use crate::store::{LedgerStore, block_key};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const BPS_DENOMINATOR: u128 = 10_000;

/// Last block height the distributor has fully handled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributorCursor {
    pub last_processed_height: Option<u64>,
}

impl DistributorCursor {
    /// Moves forward only
    pub fn advance_to(&mut self, height: u64) {
        if self.last_processed_height.is_none_or(|h| height > h) {
            self.last_processed_height = Some(height);
        }
    }

    pub fn next_height(&self, start_height: u64) -> u64 {
        self.last_processed_height
            .map(|h| h + 1)
            .unwrap_or(start_height)
            .max(start_height)
    }
}

/// Credit a miner received from one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerCredit {
    pub address: String,
    pub difficulty: u64,
    pub credit_satoshis: u64,
}

/// A pool block and its PPLNS distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub height: u64,
    pub hash: String,
    pub block_time: DateTime<Utc>,
    pub reward_satoshis: u64,
    pub pool_fee_satoshis: u64,
    pub remainder_satoshis: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_window_difficulty: u64,
    pub credits: Vec<MinerCredit>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

impl BlockEvent {
    pub fn credited_satoshis(&self) -> u64 {
        self.credits.iter().map(|c| c.credit_satoshis).sum()
    }
}

/// Result of splitting one block reward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardSplit {
    pub pool_fee_satoshis: u64,
    pub credits: Vec<MinerCredit>,
    /// Left over after flooring each credit; accrues to the pool
    pub remainder_satoshis: u64,
}

/// Split `reward` over the window.
///
/// `pool_fee = floor(reward * fee_bps / 10000)` and each miner gets
/// `floor(distributable * difficulty / total)`. Whatever the floors leave
/// is the remainder, so fee + credits + remainder always equals the reward.
pub fn compute_split(
    reward_satoshis: u64,
    pool_fee_bps: u16,
    window: &PplnsWindow,
) -> Result<RewardSplit, DistributorError> {
    if u128::from(pool_fee_bps) > BPS_DENOMINATOR {
        return Err(DistributorError::InvalidFee(pool_fee_bps));
    }
    let reward = u128::from(reward_satoshis);
    let pool_fee = reward * u128::from(pool_fee_bps) / BPS_DENOMINATOR;
    let distributable = reward - pool_fee;

    let mut credits = Vec::with_capacity(window.per_miner.len());
    let mut credited: u128 = 0;
    if window.total > 0 {
        let total = u128::from(window.total);
        for (address, difficulty) in &window.per_miner {
            if *difficulty == 0 {
                continue;
            }
            let credit = distributable * u128::from(*difficulty) / total;
            credited += credit;
            credits.push(MinerCredit {
                address: address.clone(),
                difficulty: *difficulty,
                credit_satoshis: u64::try_from(credit)
                    .map_err(|_| DistributorError::InvalidWindow("credit overflow".into()))?,
            });
        }
    }

    let remainder = distributable.checked_sub(credited).ok_or_else(|| {
        DistributorError::InvalidWindow(format!(
            "credits {credited} exceed distributable {distributable}"
        ))
    })?;

    Ok(RewardSplit {
        // Both bounded by the u64 reward
        pool_fee_satoshis: pool_fee as u64,
        credits,
        remainder_satoshis: remainder as u64,
    })
}

/// Distributor state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DistributorPhase {
    Idle = 0,
    Detecting = 1,
    Computing = 2,
    Crediting = 3,
}

impl DistributorPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DistributorPhase::Detecting,
            2 => DistributorPhase::Computing,
            3 => DistributorPhase::Crediting,
            _ => DistributorPhase::Idle,
        }
    }
}

/// Distributor settings taken from the config
#[derive(Debug, Clone)]
pub struct DistributorSettings {
    pub pool_addresses: Vec<String>,
    pub maturity_confirmations: u64,
    pub start_height: u64,
    pub max_blocks_per_run: u64,
    pub ttl: TimeDelta,
    pub pool_fee_bps: u16,
}

impl From<&Config> for DistributorSettings {
    fn from(config: &Config) -> Self {
        Self {
            pool_addresses: config.distributor.pool_addresses.clone(),
            maturity_confirmations: config.distributor.maturity_confirmations,
            start_height: config.distributor.start_height,
            max_blocks_per_run: config.distributor.max_blocks_per_run,
            ttl: config.pplns.ttl(),
            pool_fee_bps: config.pplns.pool_fee_bps,
        }
    }
}

/// Outcome of one distributor run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributionReport {
    pub tip: Option<u64>,
    pub scanned_from: Option<u64>,
    pub scanned_to: Option<u64>,
    pub blocks_credited: Vec<u64>,
}

pub struct RewardDistributor {
    store: Arc<LedgerStore>,
    node: Arc<dyn NodeRpc>,
    tracker: ShareWindowTracker,
    settings: DistributorSettings,
    phase: AtomicU8,
    run_lock: Mutex<()>,
}

impl RewardDistributor {
    pub fn new(
        store: Arc<LedgerStore>,
        node: Arc<dyn NodeRpc>,
        tracker: ShareWindowTracker,
        settings: DistributorSettings,
    ) -> Self {
        Self {
            store,
            node,
            tracker,
            settings,
            phase: AtomicU8::new(DistributorPhase::Idle as u8),
            run_lock: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> DistributorPhase {
        DistributorPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: DistributorPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// One poll: read the persisted cursor and process newly matured blocks
    pub async fn run_once(&self) -> Result<DistributionReport, DistributorError> {
        let _guard = self.run_lock.lock().await;
        let cursor = self.store.read(|state| state.cursor.clone()).await;
        let result = self.process_from(cursor).await;
        self.set_phase(DistributorPhase::Idle);
        result
    }

    async fn process_from(
        &self,
        cursor: DistributorCursor,
    ) -> Result<DistributionReport, DistributorError> {
        self.set_phase(DistributorPhase::Detecting);
        let mut report = DistributionReport::default();

        let tip = self.node.get_block_count().await?;
        report.tip = Some(tip);

        // A block at height h has tip - h + 1 confirmations
        let Some(matured_tip) = (tip + 1).checked_sub(self.settings.maturity_confirmations) else {
            debug!("Chain tip {} below maturity depth", tip);
            return Ok(report);
        };
        let from = cursor.next_height(self.settings.start_height);
        if from > matured_tip {
            debug!("No matured blocks above height {}", from.saturating_sub(1));
            return Ok(report);
        }
        let to = matured_tip.min(from + self.settings.max_blocks_per_run.max(1) - 1);
        report.scanned_from = Some(from);

        let mut scanned = None;
        for height in from..=to {
            match self.process_height(height).await {
                Ok(credited) => {
                    if credited {
                        report.blocks_credited.push(height);
                    }
                    scanned = Some(height);
                    self.set_phase(DistributorPhase::Detecting);
                }
                Err(e) => {
                    self.save_cursor(scanned).await?;
                    report.scanned_to = scanned;
                    warn!("Distributor stopped at height {}: {}", height, e);
                    return Err(e);
                }
            }
        }

        self.save_cursor(scanned).await?;
        report.scanned_to = scanned;
        if !report.blocks_credited.is_empty() {
            info!(
                "Credited {} pool block(s) between heights {} and {}",
                report.blocks_credited.len(),
                from,
                to
            );
        }
        Ok(report)
    }

    async fn save_cursor(&self, height: Option<u64>) -> Result<(), DistributorError> {
        let Some(height) = height else {
            return Ok(());
        };
        self.store
            .transact(|state| {
                state.cursor.advance_to(height);
                Ok::<_, DistributorError>(())
            })
            .await
    }

    /// Returns true when the block paid the pool and was credited now
    async fn process_height(&self, height: u64) -> Result<bool, DistributorError> {
        let hash = self.node.get_block_hash(height).await?;
        let key = block_key(height, &hash);
        let processed = self
            .store
            .read(|state| state.blocks.get(&key).is_some_and(|b| b.processed))
            .await;
        if processed {
            debug!("Block {} at height {} already processed", hash, height);
            return Ok(false);
        }

        let block = self.node.get_block(&hash).await?;
        let reward = block.reward_to(&self.settings.pool_addresses).to_sat();
        if reward == 0 {
            return Ok(false);
        }

        self.set_phase(DistributorPhase::Computing);
        let block_time = DateTime::<Utc>::from_timestamp(block.time, 0).ok_or_else(|| {
            DistributorError::InvalidWindow(format!("block time {} out of range", block.time))
        })?;
        let window = self.tracker.snapshot(block_time, self.settings.ttl).await?;
        let split = compute_split(reward, self.settings.pool_fee_bps, &window)?;
        if window.is_empty() {
            warn!(
                "Pool block {} at height {} has an empty PPLNS window, {} sat accrue to the pool",
                hash, height, split.remainder_satoshis
            );
        }

        let event = BlockEvent {
            height,
            hash,
            block_time,
            reward_satoshis: reward,
            pool_fee_satoshis: split.pool_fee_satoshis,
            remainder_satoshis: split.remainder_satoshis,
            window_start: window.start,
            window_end: window.end,
            total_window_difficulty: window.total,
            credits: split.credits,
            processed: false,
            processed_at: None,
        };

        self.set_phase(DistributorPhase::Crediting);
        self.commit_distribution(event).await
    }

    /// Apply every credit, accrue fee and remainder, and mark the block
    /// processed in one store transaction. Returns false if the block was
    /// already processed.
    pub async fn commit_distribution(&self, event: BlockEvent) -> Result<bool, DistributorError> {
        let key = block_key(event.height, &event.hash);
        let height = event.height;
        let committed = self
            .store
            .transact(|state| {
                if state.blocks.get(&key).is_some_and(|b| b.processed) {
                    return Ok::<_, DistributorError>(false);
                }
                let now = Utc::now();
                let mut applied = 0;
                for credit in &event.credits {
                    if credit.credit_satoshis > 0
                        && state.apply_block_credit(
                            height,
                            &credit.address,
                            credit.credit_satoshis,
                            now,
                        )?
                    {
                        applied += 1;
                    }
                }
                if applied < event.credits.len() {
                    debug!(
                        "Block {} had {} credit(s) applied earlier",
                        height,
                        event.credits.len() - applied
                    );
                }
                state.accrue_pool(event.pool_fee_satoshis, event.remainder_satoshis)?;
                state.blocks.insert(
                    key.clone(),
                    BlockEvent {
                        processed: true,
                        processed_at: Some(now),
                        ..event
                    },
                );
                state.cursor.advance_to(height);
                Ok(true)
            })
            .await?;

        if committed {
            info!("Block {} distribution committed", height);
        }
        Ok(committed)
    }

    /// Recorded distribution for a height
    pub async fn block_detail(&self, height: u64) -> Option<BlockEvent> {
        block_detail(&self.store, height).await
    }

    pub async fn list_blocks(&self, limit: usize) -> Vec<BlockEvent> {
        list_blocks(&self.store, limit).await
    }
}

/// Recorded distribution for a height, read straight from the store
pub async fn block_detail(store: &LedgerStore, height: u64) -> Option<BlockEvent> {
    let prefix = format!("{height:010}:");
    store
        .read(|state| {
            state
                .blocks
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(_, event)| event.clone())
                .next()
        })
        .await
}

/// Most recent block events first
pub async fn list_blocks(store: &LedgerStore, limit: usize) -> Vec<BlockEvent> {
    store
        .read(|state| state.blocks.values().rev().take(limit).cloned().collect())
        .await
}
