//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunable knobs for a [`Ledger`](crate::Ledger) instance.
///
/// Every field has a sensible default; tests override `data_dir` and
/// `database_url` to point at temporary locations.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Directory holding the flat-store blobs. Also the parent of the
    /// default SQLite database file.
    pub data_dir: PathBuf,
    /// Explicit SQLite URL for the structured store. When `None`, the
    /// database lives at `<data_dir>/homeledger.db`.
    pub database_url: Option<String>,
    /// Auto-backup after every K-th successful addition.
    pub backup_every: u32,
    /// Retain only the N most recent backups.
    pub backup_keep: usize,
    /// Minimum quiet interval between settings writes.
    pub settings_debounce: Duration,
    /// Per-topic subscription count that triggers a warning.
    pub max_handlers_per_topic: usize,
}

impl LedgerConfig {
    /// Configuration rooted at an explicit data directory.
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// The SQLite URL for the structured store.
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite:{}", self.data_dir.join("homeledger.db").display()),
        }
    }

    fn default_data_dir() -> PathBuf {
        // Same layout as other desktop data: a folder under the user's
        // home directory, with a relative-path fallback for odd setups.
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map(|home| PathBuf::from(home).join(".homeledger"))
            .unwrap_or_else(|_| PathBuf::from("homeledger_data"))
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            database_url: None,
            backup_every: 10,
            backup_keep: 5,
            settings_debounce: Duration::from_millis(500),
            max_handlers_per_topic: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_derives_from_data_dir() {
        let config = LedgerConfig::with_data_dir("/tmp/ledger-test");
        assert_eq!(config.database_url(), "sqlite:/tmp/ledger-test/homeledger.db");
    }

    #[test]
    fn explicit_database_url_wins() {
        let config = LedgerConfig {
            database_url: Some("sqlite::memory:".to_string()),
            ..LedgerConfig::with_data_dir("/tmp/ledger-test")
        };
        assert_eq!(config.database_url(), "sqlite::memory:");
    }
}
