use super::{ShareFilter, ShareStore, ShareStoreError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-miner and pool-wide difficulty within `[start, end]`.
/// Derived from shares on every use, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PplnsWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub per_miner: BTreeMap<String, u64>,
    pub total: u64,
}

impl PplnsWindow {
    pub fn from_per_miner(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        per_miner: BTreeMap<String, u64>,
    ) -> Result<Self, ShareStoreError> {
        let total = per_miner
            .values()
            .try_fold(0u64, |acc, d| acc.checked_add(*d))
            .ok_or(ShareStoreError::Overflow)?;
        Ok(Self {
            start,
            end,
            per_miner,
            total,
        })
    }

    pub fn difficulty_of(&self, miner: &str) -> u64 {
        self.per_miner.get(miner).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Computes PPLNS windows from the share store
#[derive(Clone)]
pub struct ShareWindowTracker {
    store: Arc<dyn ShareStore>,
}

impl ShareWindowTracker {
    pub fn new(store: Arc<dyn ShareStore>) -> Self {
        Self { store }
    }

    /// `(miner_difficulty, total_difficulty)` over `[now - ttl, now]`, evaluated now
    pub async fn window_for(
        &self,
        miner: &str,
        ttl: TimeDelta,
    ) -> Result<(u64, u64), ShareStoreError> {
        let window = self.snapshot(Utc::now(), ttl).await?;
        Ok((window.difficulty_of(miner), window.total))
    }

    /// Window over `[at - ttl, at]`
    pub async fn snapshot(
        &self,
        at: DateTime<Utc>,
        ttl: TimeDelta,
    ) -> Result<PplnsWindow, ShareStoreError> {
        let start = at - ttl;
        let per_miner = self
            .store
            .aggregate(&ShareFilter::between(start, at))
            .await?;
        PplnsWindow::from_per_miner(start, at, per_miner)
    }
}
