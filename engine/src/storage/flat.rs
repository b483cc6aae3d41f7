//! Flat-file fallback backend.
//!
//! One JSON blob per logical collection (`transactions.json`,
//! `settings.json`, `backups.json`) under a data directory. Reads and
//! writes are whole-collection, so every operation costs O(collection
//! size) — acceptable on the degraded path. Writes go to a temporary
//! file first and are renamed into place, so a crash mid-write leaves
//! the previous blob intact.

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use shared::{BackupRecord, SettingsRecord, Snapshot, Transaction};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{BackendKind, StorageBackend, StorageResult};

const TRANSACTIONS_FILE: &str = "transactions.json";
const SETTINGS_FILE: &str = "settings.json";
const BACKUPS_FILE: &str = "backups.json";

/// Blob-per-collection store rooted at a directory.
#[derive(Clone)]
pub struct FlatStore {
    dir: PathBuf,
}

impl FlatStore {
    /// Open the store, creating the directory if needed. Missing blob
    /// files are treated as empty collections.
    pub fn open<P: AsRef<Path>>(dir: P) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "flat store opened");
        Ok(Self { dir })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn read_collection<T: DeserializeOwned>(&self, file: &str) -> StorageResult<Option<T>> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn write_collection<T: Serialize>(&self, file: &str, value: &T) -> StorageResult<()> {
        let path = self.path(file);
        let temp_path = path.with_extension("tmp");

        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, value)?;
            writer.flush()?;
        }

        // Atomic move from temp to final file
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn read_transactions(&self) -> StorageResult<Vec<Transaction>> {
        Ok(self.read_collection(TRANSACTIONS_FILE)?.unwrap_or_default())
    }

    /// Replace the whole transaction collection. Also used by the ledger
    /// to mirror its in-memory state here when the structured store
    /// fails mid-session.
    pub fn write_transactions(&self, transactions: &[Transaction]) -> StorageResult<()> {
        self.write_collection(TRANSACTIONS_FILE, &transactions)
    }

    fn read_backups(&self) -> StorageResult<Vec<BackupRecord>> {
        Ok(self.read_collection(BACKUPS_FILE)?.unwrap_or_default())
    }
}

#[async_trait]
impl StorageBackend for FlatStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Flat
    }

    async fn get_all_transactions(&self) -> StorageResult<Vec<Transaction>> {
        self.read_transactions()
    }

    async fn add_transaction(&self, transaction: &Transaction) -> StorageResult<()> {
        let mut transactions = self.read_transactions()?;
        transactions.push(transaction.clone());
        self.write_transactions(&transactions)
    }

    async fn update_transaction(&self, transaction: &Transaction) -> StorageResult<()> {
        let mut transactions = self.read_transactions()?;
        if let Some(slot) = transactions.iter_mut().find(|t| t.id == transaction.id) {
            *slot = transaction.clone();
        }
        self.write_transactions(&transactions)
    }

    async fn delete_transaction(&self, id: &str) -> StorageResult<bool> {
        let mut transactions = self.read_transactions()?;
        let before = transactions.len();
        transactions.retain(|t| t.id != id);
        let removed = transactions.len() != before;
        if removed {
            self.write_transactions(&transactions)?;
        }
        Ok(removed)
    }

    async fn add_transactions_batch(&self, batch: &[Transaction]) -> StorageResult<()> {
        let mut transactions = self.read_transactions()?;
        transactions.extend_from_slice(batch);
        self.write_transactions(&transactions)
    }

    async fn clear_transactions(&self) -> StorageResult<()> {
        self.write_transactions(&[])
    }

    async fn get_settings(&self) -> StorageResult<Option<SettingsRecord>> {
        self.read_collection(SETTINGS_FILE)
    }

    async fn save_settings(&self, settings: &SettingsRecord) -> StorageResult<()> {
        self.write_collection(SETTINGS_FILE, settings)
    }

    async fn create_backup(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let mut backups = self.read_backups()?;
        let seq = backups.last().map_or(1, |b| b.seq + 1);
        backups.push(BackupRecord {
            seq,
            created_at: Utc::now(),
            payload: snapshot.clone(),
        });
        self.write_collection(BACKUPS_FILE, &backups)
    }

    async fn get_latest_backup(&self) -> StorageResult<Option<BackupRecord>> {
        Ok(self.read_backups()?.into_iter().last())
    }

    async fn list_backups(&self) -> StorageResult<Vec<BackupRecord>> {
        self.read_backups()
    }

    async fn prune_backups(&self, keep: usize) -> StorageResult<()> {
        let backups = self.read_backups()?;
        if backups.len() <= keep {
            return Ok(());
        }
        let excess = backups.len() - keep;
        let kept: Vec<BackupRecord> = backups.into_iter().skip(excess).collect();
        self.write_collection(BACKUPS_FILE, &kept)
    }

    async fn close(&self) -> StorageResult<()> {
        // Nothing held open between operations.
        Ok(())
    }
}
