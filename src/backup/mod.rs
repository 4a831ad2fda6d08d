// Automated backup module for DMPool
// Provides ledger backup, restore, and verification

use crate::store::{LEDGER_FILE, LedgerState, LedgerStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const BACKUP_PREFIX: &str = "dmpool_backup_";
const METADATA_FILE: &str = "metadata.json";

/// Backup manager for the DMPool ledger
#[derive(Clone)]
pub struct BackupManager {
    store_dir: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
    /// Live store to snapshot; without one the ledger file is copied
    store: Option<Arc<LedgerStore>>,
}

impl BackupManager {
    /// Create a new backup manager
    pub fn new(store_dir: PathBuf, backup_dir: PathBuf, max_backups: usize) -> Result<Self> {
        std::fs::create_dir_all(&backup_dir).context("Failed to create backup directory")?;

        Ok(Self {
            store_dir,
            backup_dir,
            max_backups,
            store: None,
        })
    }

    pub fn with_store(mut self, store: Arc<LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Perform a backup
    pub async fn backup(&self) -> Result<BackupInfo> {
        let contents = match &self.store {
            Some(store) => store
                .snapshot_json()
                .await
                .context("Failed to snapshot ledger")?,
            None => {
                let path = self.store_dir.join(LEDGER_FILE);
                std::fs::read(&path)
                    .with_context(|| format!("Failed to read ledger {}", path.display()))?
            }
        };

        let timestamp = Utc::now();
        let (backup_name, backup_path) = self.unused_backup_path(timestamp);
        info!("Starting backup to: {}", backup_path.display());

        std::fs::create_dir_all(&backup_path).context("Failed to create backup directory")?;
        std::fs::write(backup_path.join(LEDGER_FILE), &contents)
            .context("Failed to write ledger backup")?;

        let metadata = BackupMetadata {
            backup_name: backup_name.clone(),
            created_at: timestamp,
            store_path: self.store_dir.clone(),
            backup_path: backup_path.clone(),
            size_bytes: contents.len() as u64,
            sha256: checksum(&contents),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        self.save_metadata(&metadata)?;

        self.cleanup_old_backups()?;

        info!(
            "Backup completed: {} ({} bytes)",
            backup_name, metadata.size_bytes
        );
        Ok(BackupInfo {
            path: backup_path,
            metadata,
        })
    }

    /// Restore from a backup. The daemon must be stopped.
    pub fn restore(&self, backup_name: &str) -> Result<()> {
        info!("Restoring from backup: {}", backup_name);

        let backup_path = self.backup_path(backup_name)?;
        if !self.verify(backup_name)? {
            return Err(anyhow::anyhow!(
                "Backup {} failed verification, not restoring",
                backup_name
            ));
        }

        std::fs::create_dir_all(&self.store_dir).context("Failed to create store directory")?;
        let current = self.store_dir.join(LEDGER_FILE);
        if current.exists() {
            let pre_restore = self
                .backup_dir
                .join(format!("pre_restore_{}", Utc::now().format("%Y%m%d_%H%M%S")));
            std::fs::create_dir_all(&pre_restore)?;
            std::fs::copy(&current, pre_restore.join(LEDGER_FILE))
                .context("Failed to save current ledger before restore")?;
            info!("Pre-restore copy saved: {}", pre_restore.display());
        }

        // Same rename-into-place as the store uses
        let tmp = self.store_dir.join(format!("{LEDGER_FILE}.restore"));
        std::fs::copy(backup_path.join(LEDGER_FILE), &tmp)
            .context("Failed to copy backup into store directory")?;
        std::fs::rename(&tmp, &current).context("Failed to replace ledger")?;

        info!("Restore completed successfully");
        Ok(())
    }

    /// List all available backups, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let mut backups = Vec::new();

        for entry in std::fs::read_dir(&self.backup_dir).context("Failed to read backup directory")?
        {
            let path = entry?.path();
            let is_backup = path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(BACKUP_PREFIX));
            if !is_backup {
                continue;
            }
            match load_metadata(&path) {
                Ok(metadata) => backups.push(metadata),
                Err(e) => warn!("Failed to load metadata for {:?}: {}", path, e),
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Check the backup's checksum and that it parses as a ledger
    pub fn verify(&self, backup_name: &str) -> Result<bool> {
        let backup_path = self.backup_path(backup_name)?;
        let metadata = load_metadata(&backup_path)?;

        let Ok(contents) = std::fs::read(backup_path.join(LEDGER_FILE)) else {
            warn!("Backup {} has no ledger file", backup_name);
            return Ok(false);
        };
        if contents.len() as u64 != metadata.size_bytes || checksum(&contents) != metadata.sha256
        {
            warn!("Backup {} checksum mismatch", backup_name);
            return Ok(false);
        }
        if let Err(e) = serde_json::from_slice::<LedgerState>(&contents) {
            warn!("Backup {} is not a valid ledger: {}", backup_name, e);
            return Ok(false);
        }
        Ok(true)
    }

    fn backup_path(&self, backup_name: &str) -> Result<PathBuf> {
        // Names come from the CLI; keep them inside the backup directory
        if backup_name.contains(['/', '\\']) || backup_name.starts_with('.') {
            return Err(anyhow::anyhow!("Invalid backup name: {}", backup_name));
        }
        let path = self.backup_dir.join(backup_name);
        if !path.exists() {
            return Err(anyhow::anyhow!("Backup not found: {}", backup_name));
        }
        Ok(path)
    }

    fn unused_backup_path(&self, timestamp: DateTime<Utc>) -> (String, PathBuf) {
        let base = format!("{BACKUP_PREFIX}{}", timestamp.format("%Y%m%d_%H%M%S_%6f"));
        let mut name = base.clone();
        let mut suffix = 1;
        while self.backup_dir.join(&name).exists() {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }
        let path = self.backup_dir.join(&name);
        (name, path)
    }

    fn cleanup_old_backups(&self) -> Result<()> {
        let backups = self.list_backups()?;

        if backups.len() <= self.max_backups {
            return Ok(());
        }

        for backup in &backups[self.max_backups..] {
            info!("Removing old backup: {}", backup.backup_name);
            std::fs::remove_dir_all(&backup.backup_path)
                .with_context(|| format!("Failed to remove backup: {}", backup.backup_name))?;
        }

        Ok(())
    }

    fn save_metadata(&self, metadata: &BackupMetadata) -> Result<()> {
        let json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(metadata.backup_path.join(METADATA_FILE), json)?;
        Ok(())
    }
}

fn load_metadata(backup_path: &Path) -> Result<BackupMetadata> {
    let json = std::fs::read_to_string(backup_path.join(METADATA_FILE))
        .with_context(|| format!("No metadata in {}", backup_path.display()))?;
    Ok(serde_json::from_str(&json)?)
}

fn checksum(contents: &[u8]) -> String {
    format!("{:x}", Sha256::digest(contents))
}

/// Backup information
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub metadata: BackupMetadata,
}

/// Backup metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackupMetadata {
    pub backup_name: String,
    pub created_at: DateTime<Utc>,
    pub store_path: PathBuf,
    pub backup_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub version: String,
}
