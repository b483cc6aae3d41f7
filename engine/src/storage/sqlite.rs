//! Structured storage backend on SQLite.
//!
//! Three collections: `transactions` (primary key `id`, secondary indexes
//! on date/kind/category plus a composite date+kind), `settings` (single
//! row under a constant key), and `backups` (auto-incrementing sequence
//! with an index on creation time). Schema setup is additive and
//! idempotent — every statement is `IF NOT EXISTS`, so re-running a
//! version bump on an already-upgraded database is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use shared::{BackupRecord, SettingsRecord, Snapshot, Transaction, TransactionKind};
use sqlx::{migrate::MigrateDatabase, sqlite::SqliteRow, Row, Sqlite, SqlitePool};
use std::sync::Arc;
use tracing::debug;

use super::{BackendError, BackendKind, StorageBackend, StorageResult};

const SCHEMA_VERSION: i64 = 1;
const SETTINGS_KEY: &str = "ledger";

/// SQLite-backed structured store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    /// Open (creating if necessary) the database at `url` and bring the
    /// schema up to date. Failure here is what sends the ledger down the
    /// flat-store fallback path.
    pub async fn open(url: &str) -> StorageResult<Self> {
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            Sqlite::create_database(url).await?;
        }

        let pool = SqlitePool::connect(url).await?;
        Self::setup_schema(&pool).await?;
        debug!(url, "structured store opened");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Open a uniquely named in-memory database for tests.
    #[cfg(test)]
    pub async fn open_in_memory() -> StorageResult<Self> {
        let test_id = uuid::Uuid::new_v4().to_string();
        let url = format!("sqlite:file:memdb_{}?mode=memory&cache=shared", test_id);
        Self::open(&url).await
    }

    async fn setup_schema(pool: &SqlitePool) -> StorageResult<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(pool)
            .await?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                kind TEXT NOT NULL,
                category TEXT NOT NULL,
                amount INTEGER NOT NULL,
                note TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(date);",
            "CREATE INDEX IF NOT EXISTS idx_transactions_kind ON transactions(kind);",
            "CREATE INDEX IF NOT EXISTS idx_transactions_category ON transactions(category);",
            "CREATE INDEX IF NOT EXISTS idx_transactions_date_kind ON transactions(date, kind);",
        ] {
            sqlx::query(statement).execute(pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backups (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_backups_created_at ON backups(created_at);")
            .execute(pool)
            .await?;

        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(pool)
            .await?;

        Ok(())
    }

    fn row_to_transaction(row: &SqliteRow) -> StorageResult<Transaction> {
        let date_raw: String = row.get("date");
        let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
            .map_err(|e| BackendError::Corrupt(format!("bad date {:?}: {}", date_raw, e)))?;

        let kind_raw: String = row.get("kind");
        let kind = TransactionKind::parse(&kind_raw)
            .ok_or_else(|| BackendError::Corrupt(format!("bad kind {:?}", kind_raw)))?;

        Ok(Transaction {
            id: row.get("id"),
            date,
            kind,
            category: row.get("category"),
            amount: row.get("amount"),
            note: row.get("note"),
            created_at: parse_timestamp(row.get("created_at"))?,
            updated_at: parse_timestamp(row.get("updated_at"))?,
        })
    }
}

fn parse_timestamp(raw: String) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BackendError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

#[async_trait]
impl StorageBackend for SqliteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Structured
    }

    async fn get_all_transactions(&self) -> StorageResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, date, kind, category, amount, note, created_at, updated_at
            FROM transactions
            ORDER BY date ASC, created_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn add_transaction(&self, transaction: &Transaction) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (id, date, kind, category, amount, note, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&transaction.id)
        .bind(transaction.date.format("%Y-%m-%d").to_string())
        .bind(transaction.kind.as_str())
        .bind(&transaction.category)
        .bind(transaction.amount)
        .bind(&transaction.note)
        .bind(transaction.created_at.to_rfc3339())
        .bind(transaction.updated_at.to_rfc3339())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn update_transaction(&self, transaction: &Transaction) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE transactions
            SET date = ?, kind = ?, category = ?, amount = ?, note = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(transaction.date.format("%Y-%m-%d").to_string())
        .bind(transaction.kind.as_str())
        .bind(&transaction.category)
        .bind(transaction.amount)
        .bind(&transaction.note)
        .bind(transaction.updated_at.to_rfc3339())
        .bind(&transaction.id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn delete_transaction(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_transactions_batch(&self, transactions: &[Transaction]) -> StorageResult<()> {
        let mut db_tx = self.pool.begin().await?;
        for transaction in transactions {
            sqlx::query(
                r#"
                INSERT INTO transactions (id, date, kind, category, amount, note, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&transaction.id)
            .bind(transaction.date.format("%Y-%m-%d").to_string())
            .bind(transaction.kind.as_str())
            .bind(&transaction.category)
            .bind(transaction.amount)
            .bind(&transaction.note)
            .bind(transaction.created_at.to_rfc3339())
            .bind(transaction.updated_at.to_rfc3339())
            .execute(&mut *db_tx)
            .await?;
        }
        db_tx.commit().await?;
        Ok(())
    }

    async fn clear_transactions(&self) -> StorageResult<()> {
        sqlx::query("DELETE FROM transactions")
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn get_settings(&self) -> StorageResult<Option<SettingsRecord>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM settings WHERE key = ?")
                .bind(SETTINGS_KEY)
                .fetch_optional(&*self.pool)
                .await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &SettingsRecord) -> StorageResult<()> {
        let payload = serde_json::to_string(settings)?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, payload) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET payload = excluded.payload
            "#,
        )
        .bind(SETTINGS_KEY)
        .bind(payload)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn create_backup(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let payload = serde_json::to_string(snapshot)?;
        sqlx::query("INSERT INTO backups (created_at, payload) VALUES (?, ?)")
            .bind(Utc::now().to_rfc3339())
            .bind(payload)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn get_latest_backup(&self) -> StorageResult<Option<BackupRecord>> {
        let row = sqlx::query("SELECT seq, created_at, payload FROM backups ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&*self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_backup(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_backups(&self) -> StorageResult<Vec<BackupRecord>> {
        let rows = sqlx::query("SELECT seq, created_at, payload FROM backups ORDER BY seq ASC")
            .fetch_all(&*self.pool)
            .await?;
        rows.iter().map(row_to_backup).collect()
    }

    async fn prune_backups(&self, keep: usize) -> StorageResult<()> {
        sqlx::query(
            r#"
            DELETE FROM backups
            WHERE seq NOT IN (SELECT seq FROM backups ORDER BY seq DESC LIMIT ?)
            "#,
        )
        .bind(keep as i64)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn row_to_backup(row: &SqliteRow) -> StorageResult<BackupRecord> {
    let payload_raw: String = row.get("payload");
    Ok(BackupRecord {
        seq: row.get("seq"),
        created_at: parse_timestamp(row.get("created_at"))?,
        payload: serde_json::from_str(&payload_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{CategorySets, LedgerStats, SNAPSHOT_VERSION};

    async fn setup_test() -> SqliteStore {
        SqliteStore::open_in_memory()
            .await
            .expect("Failed to create test database")
    }

    fn sample(id: &str, amount: i64) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            kind: TransactionKind::Income,
            category: "Salary".to_string(),
            amount,
            note: "test".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_snapshot(marker: u64) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: Utc::now(),
            transactions: vec![sample("snap-tx", 100)],
            categories: CategorySets::default(),
            stats: LedgerStats {
                lifetime_added: marker,
                ..LedgerStats::default()
            },
        }
    }

    #[tokio::test]
    async fn schema_setup_is_idempotent() {
        let store = setup_test().await;
        // Re-running against the same pool must not fail or duplicate.
        SqliteStore::setup_schema(&store.pool)
            .await
            .expect("Second schema pass should be a no-op");
    }

    #[tokio::test]
    async fn transaction_round_trip() {
        let store = setup_test().await;
        let tx = sample("tx-1", 300_000);
        store.add_transaction(&tx).await.expect("Failed to store");

        let all = store
            .get_all_transactions()
            .await
            .expect("Failed to read back");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, tx.id);
        assert_eq!(all[0].date, tx.date);
        assert_eq!(all[0].kind, tx.kind);
        assert_eq!(all[0].amount, tx.amount);
        assert_eq!(all[0].note, tx.note);
    }

    #[tokio::test]
    async fn update_replaces_fields_in_place() {
        let store = setup_test().await;
        let mut tx = sample("tx-1", 300_000);
        store.add_transaction(&tx).await.expect("Failed to store");

        tx.amount = 250_000;
        tx.note = "revised".to_string();
        store.update_transaction(&tx).await.expect("Failed to update");

        let all = store.get_all_transactions().await.expect("Failed to read");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].amount, 250_000);
        assert_eq!(all[0].note, "revised");
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_existed() {
        let store = setup_test().await;
        store
            .add_transaction(&sample("tx-1", 100))
            .await
            .expect("Failed to store");

        assert!(store.delete_transaction("tx-1").await.expect("delete"));
        assert!(!store.delete_transaction("tx-1").await.expect("delete"));
        assert!(store
            .get_all_transactions()
            .await
            .expect("read")
            .is_empty());
    }

    #[tokio::test]
    async fn batch_insert_is_atomic() {
        let store = setup_test().await;
        store
            .add_transaction(&sample("dup", 100))
            .await
            .expect("Failed to store");

        // Second row collides with the existing primary key, so the whole
        // batch must roll back.
        let batch = vec![sample("fresh", 200), sample("dup", 300)];
        let result = store.add_transactions_batch(&batch).await;
        assert!(result.is_err());

        let all = store.get_all_transactions().await.expect("read");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "dup");
    }

    #[tokio::test]
    async fn clear_empties_the_collection() {
        let store = setup_test().await;
        store
            .add_transactions_batch(&[sample("a", 1), sample("b", 2)])
            .await
            .expect("batch");
        store.clear_transactions().await.expect("clear");
        assert!(store.get_all_transactions().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = setup_test().await;
        assert!(store.get_settings().await.expect("get").is_none());

        let mut settings = SettingsRecord::default();
        settings.categories.income.push("Salary".to_string());
        settings.stats.lifetime_added = 7;
        store.save_settings(&settings).await.expect("save");

        let loaded = store.get_settings().await.expect("get").expect("present");
        assert_eq!(loaded, settings);

        // Saving again overwrites the single row.
        settings.stats.lifetime_added = 8;
        store.save_settings(&settings).await.expect("save again");
        let reloaded = store.get_settings().await.expect("get").expect("present");
        assert_eq!(reloaded.stats.lifetime_added, 8);
    }

    #[tokio::test]
    async fn backups_are_sequenced_and_pruned_oldest_first() {
        let store = setup_test().await;
        assert!(store.get_latest_backup().await.expect("latest").is_none());

        for marker in 1..=4 {
            store
                .create_backup(&sample_snapshot(marker))
                .await
                .expect("backup");
        }

        let latest = store
            .get_latest_backup()
            .await
            .expect("latest")
            .expect("present");
        assert_eq!(latest.payload.stats.lifetime_added, 4);

        store.prune_backups(2).await.expect("prune");
        let remaining = store.list_backups().await.expect("list");
        let markers: Vec<u64> = remaining
            .iter()
            .map(|b| b.payload.stats.lifetime_added)
            .collect();
        assert_eq!(markers, vec![3, 4]);
    }
}
