// Share source for DMPool
// Read-only access to accepted shares written by the stratum server

mod postgres;
mod window;

pub use postgres::PgShareStore;
pub use window::{PplnsWindow, ShareWindowTracker};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// An accepted share. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub miner_address: String,
    pub worker_name: String,
    pub difficulty: u64,
    pub timestamp: DateTime<Utc>,
}

/// Typed share query. Bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareFilter {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub miner: Option<String>,
}

impl ShareFilter {
    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since,
            until,
            miner: None,
        }
    }

    pub fn for_miner(mut self, miner: impl Into<String>) -> Self {
        self.miner = Some(miner.into());
        self
    }

    pub fn matches(&self, share: &Share) -> bool {
        share.timestamp >= self.since
            && share.timestamp <= self.until
            && self
                .miner
                .as_ref()
                .is_none_or(|miner| *miner == share.miner_address)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShareStoreError {
    #[error("Share database error: {0}")]
    Database(String),
    #[error("Share database pool error: {0}")]
    Pool(String),
    #[error("Invalid share row: {0}")]
    InvalidRow(String),
    #[error("Difficulty sum overflow")]
    Overflow,
}

/// Source of accepted shares
#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn shares(&self, filter: &ShareFilter) -> Result<Vec<Share>, ShareStoreError>;

    /// Difficulty per miner for the filter
    async fn aggregate(
        &self,
        filter: &ShareFilter,
    ) -> Result<BTreeMap<String, u64>, ShareStoreError> {
        let mut per_miner = BTreeMap::new();
        for share in self.shares(filter).await? {
            let entry = per_miner.entry(share.miner_address).or_insert(0u64);
            *entry = entry
                .checked_add(share.difficulty)
                .ok_or(ShareStoreError::Overflow)?;
        }
        Ok(per_miner)
    }
}

/// In-process share store
#[derive(Debug, Default)]
pub struct MemoryShareStore {
    shares: RwLock<Vec<Share>>,
}

impl MemoryShareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_share(&self, share: Share) {
        self.shares.write().await.push(share);
    }

    pub async fn len(&self) -> usize {
        self.shares.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shares.read().await.is_empty()
    }
}

#[async_trait]
impl ShareStore for MemoryShareStore {
    async fn shares(&self, filter: &ShareFilter) -> Result<Vec<Share>, ShareStoreError> {
        Ok(self
            .shares
            .read()
            .await
            .iter()
            .filter(|share| filter.matches(share))
            .cloned()
            .collect())
    }
}
