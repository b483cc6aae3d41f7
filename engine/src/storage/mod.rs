//! Storage backends for the ledger engine.
//!
//! Two interchangeable implementations sit behind [`StorageBackend`]:
//! [`sqlite::SqliteStore`], the structured, indexed, schema-versioned
//! store used on the happy path, and [`flat::FlatStore`], a
//! blob-per-collection fallback for environments where the structured
//! store is unavailable or fails to open. The ledger selects one at
//! initialization time and owns the handle exclusively.

pub mod flat;
pub mod sqlite;

use async_trait::async_trait;
use shared::{BackupRecord, SettingsRecord, Snapshot, Transaction};
use thiserror::Error;

/// Which implementation is behind the handle; exposed so collaborators
/// can surface a "degraded storage" indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Structured,
    Flat,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("stored data is malformed: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

pub type StorageResult<T> = Result<T, BackendError>;

/// Persistence contract shared by both backends.
///
/// Every method is one atomic unit of work: it either fully applies or
/// returns an error leaving the stored state untouched. Backends never
/// validate — the ledger has already done that by the time data gets
/// here.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn get_all_transactions(&self) -> StorageResult<Vec<Transaction>>;
    async fn add_transaction(&self, transaction: &Transaction) -> StorageResult<()>;
    async fn update_transaction(&self, transaction: &Transaction) -> StorageResult<()>;
    /// Returns whether a record was actually removed.
    async fn delete_transaction(&self, id: &str) -> StorageResult<bool>;
    /// Commit all records as a single atomic write.
    async fn add_transactions_batch(&self, transactions: &[Transaction]) -> StorageResult<()>;
    async fn clear_transactions(&self) -> StorageResult<()>;

    async fn get_settings(&self) -> StorageResult<Option<SettingsRecord>>;
    async fn save_settings(&self, settings: &SettingsRecord) -> StorageResult<()>;

    async fn create_backup(&self, snapshot: &Snapshot) -> StorageResult<()>;
    async fn get_latest_backup(&self) -> StorageResult<Option<BackupRecord>>;
    /// Backups ordered oldest first.
    async fn list_backups(&self) -> StorageResult<Vec<BackupRecord>>;
    /// Keep only the `keep` most recent backups.
    async fn prune_backups(&self, keep: usize) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}
