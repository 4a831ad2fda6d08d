// Persisted ledger state for DMPool
// Single JSON document, replaced atomically on every transaction

use crate::distributor::{BlockEvent, DistributorCursor};
use crate::ledger::{MinerBalance, PoolAccount};
use crate::payout::Payout;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const LEDGER_FILE: &str = "ledger.json";
const LEDGER_TMP_FILE: &str = "ledger.json.tmp";
const STATE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize ledger state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Corrupt ledger state in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unsupported ledger state version {0}")]
    UnsupportedVersion(u32),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

/// Everything the engine persists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerState {
    pub version: u32,
    pub balances: BTreeMap<String, MinerBalance>,
    /// Credits already applied, keyed by (block height, miner address)
    pub applied_credits: BTreeSet<(u64, String)>,
    /// Block events keyed by `block_key(height, hash)`
    pub blocks: BTreeMap<String, BlockEvent>,
    pub payouts: BTreeMap<Uuid, Payout>,
    pub pool: PoolAccount,
    pub cursor: DistributorCursor,
    /// Per-miner minimum payout thresholds in satoshis
    pub threshold_overrides: BTreeMap<String, u64>,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            balances: BTreeMap::new(),
            applied_credits: BTreeSet::new(),
            blocks: BTreeMap::new(),
            payouts: BTreeMap::new(),
            pool: PoolAccount::default(),
            cursor: DistributorCursor::default(),
            threshold_overrides: BTreeMap::new(),
        }
    }
}

/// Idempotency key of a block event. Zero padded so keys sort by height.
pub fn block_key(height: u64, hash: &str) -> String {
    format!("{height:010}:{hash}")
}

/// Owner of the persisted state. Every mutation goes through `transact`,
/// which runs against a copy and only swaps it in once it is on disk.
pub struct LedgerStore {
    dir: Option<PathBuf>,
    state: Mutex<LedgerState>,
}

impl LedgerStore {
    /// Open the store in `dir`, creating an empty ledger if none exists
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(&dir))?;

        let path = dir.join(LEDGER_FILE);
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: LedgerState =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                if state.version != STATE_VERSION {
                    return Err(StoreError::UnsupportedVersion(state.version));
                }
                info!(
                    "Loaded ledger from {} ({} balances, {} blocks, {} payouts)",
                    path.display(),
                    state.balances.len(),
                    state.blocks.len(),
                    state.payouts.len()
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No ledger at {}, starting empty", path.display());
                LedgerState::default()
            }
            Err(e) => return Err(io_error(&path)(e)),
        };

        Ok(Self {
            dir: Some(dir),
            state: Mutex::new(state),
        })
    }

    /// Non-persistent store
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Side-effect-free read of the current state
    pub async fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> T {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Apply `f` as one atomic unit. On error nothing is persisted and the
    /// live state is untouched.
    pub async fn transact<T, E>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let result = f(&mut next)?;
        if let Some(dir) = &self.dir {
            persist(dir, &next).await?;
        }
        *state = next;
        Ok(result)
    }

    /// Serialized copy of the current state, for backups
    pub async fn snapshot_json(&self) -> Result<Vec<u8>, StoreError> {
        let state = self.state.lock().await;
        Ok(serde_json::to_vec_pretty(&*state)?)
    }
}

/// Write to a temp file, fsync, then rename over the ledger
async fn persist(dir: &Path, state: &LedgerState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state)?;
    let tmp = dir.join(LEDGER_TMP_FILE);
    let path = dir.join(LEDGER_FILE);

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(io_error(&tmp))?;
    file.write_all(&bytes).await.map_err(io_error(&tmp))?;
    file.sync_all().await.map_err(io_error(&tmp))?;
    drop(file);

    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(io_error(&path))?;
    debug!("Persisted ledger ({} bytes)", bytes.len());
    Ok(())
}
