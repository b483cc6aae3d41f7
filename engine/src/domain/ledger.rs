//! The ledger: owner of all transaction records, the category registry,
//! the derived-aggregate caches, and the persistence orchestration.
//!
//! Mutations follow one shape: validate, apply to memory, invalidate
//! caches, persist to the active backend (degrading to the flat fallback
//! on write failure — the in-memory state is never lost), then emit
//! events. Because the in-memory mutation happens before the persist
//! await point, memory always reflects issue order even when callers
//! interleave awaits.

use chrono::{Datelike, NaiveDate, Utc};
use shared::{
    BackupRecord, BatchOutcome, BatchRowError, CategorySets, FilterState, IntegrityIssue,
    IntegrityReport, LedgerStats, MonthTotals, RepairAction, SettingsRecord, Snapshot, Summary,
    Transaction, TransactionDraft, TransactionKind, TransactionPatch, SNAPSHOT_VERSION,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::domain::backup::BackupPolicy;
use crate::domain::validate::{
    amount_in_range, date_in_range, validate_category_name, validate_draft, MAX_NOTE_CHARS,
};
use crate::error::{LedgerError, LedgerResult, ValidationErrors};
use crate::events::{EventBus, LedgerEvent};
use crate::storage::flat::FlatStore;
use crate::storage::sqlite::SqliteStore;
use crate::storage::{BackendError, StorageBackend};

/// Category assigned to orphaned transactions during `repair()`.
pub const DEFAULT_CATEGORY: &str = "Uncategorized";

/// Lifecycle of a ledger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Uninitialized,
    Initializing,
    /// Structured backend active.
    Ready,
    /// Running on the flat fallback or fully in memory.
    DegradedReady,
    /// Terminal; every further call is rejected.
    Destroyed,
}

/// Which persistence path is active for this session. Selected once at
/// initialization and never swapped mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Structured,
    Flat,
    Memory,
}

pub struct Ledger {
    config: LedgerConfig,
    bus: EventBus,
    state: LedgerState,
    mode: StorageMode,
    backend: Option<Box<dyn StorageBackend>>,
    /// Lazily opened when a structured-store write fails mid-session;
    /// mirrors the full in-memory state so nothing is lost.
    fallback: Option<FlatStore>,
    transactions: Vec<Transaction>,
    categories: CategorySets,
    filters: FilterState,
    stats: LedgerStats,
    summary_cache: Option<(usize, Summary)>,
    monthly_cache: HashMap<(u32, String), BTreeMap<String, MonthTotals>>,
    backups: BackupPolicy,
    settings_dirty: bool,
    last_settings_write: Option<Instant>,
    durability_degraded: bool,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Self {
        let bus = EventBus::new(config.max_handlers_per_topic);
        let backups = BackupPolicy::new(config.backup_every, config.backup_keep);
        Self {
            bus,
            backups,
            state: LedgerState::Uninitialized,
            mode: StorageMode::Memory,
            backend: None,
            fallback: None,
            transactions: Vec::new(),
            categories: CategorySets::default(),
            filters: FilterState::default(),
            stats: LedgerStats::default(),
            summary_cache: None,
            monthly_cache: HashMap::new(),
            settings_dirty: false,
            last_settings_write: None,
            durability_degraded: false,
            config,
        }
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Open the preferred backend (falling back as needed), load
    /// persisted state, and emit `Loaded` then `Changed`.
    ///
    /// Never fails short of a destroyed instance: if both backends are
    /// unusable the ledger starts empty and in-memory-only.
    pub async fn initialize(&mut self) -> LedgerResult<()> {
        match self.state {
            LedgerState::Destroyed => return Err(LedgerError::Destroyed),
            LedgerState::Ready | LedgerState::DegradedReady => return Ok(()),
            LedgerState::Uninitialized | LedgerState::Initializing => {}
        }
        self.state = LedgerState::Initializing;

        let url = self.config.database_url();
        match SqliteStore::open(&url).await {
            Ok(store) => {
                self.backend = Some(Box::new(store));
                self.mode = StorageMode::Structured;
            }
            Err(err) => {
                warn!(error = %err, "structured store failed to open, falling back to flat store");
                self.open_flat_backend();
            }
        }

        if let Err(err) = self.load_persisted_state().await {
            warn!(error = %err, "failed to load persisted state");
            if self.mode == StorageMode::Structured {
                self.open_flat_backend();
                if let Err(err) = self.load_persisted_state().await {
                    warn!(error = %err, "flat store could not be loaded either");
                    self.enter_memory_mode();
                }
            } else {
                self.enter_memory_mode();
            }
        }

        self.state = if self.mode == StorageMode::Structured {
            LedgerState::Ready
        } else {
            LedgerState::DegradedReady
        };
        info!(
            mode = ?self.mode,
            transactions = self.transactions.len(),
            "ledger initialized"
        );

        self.emit(LedgerEvent::Loaded).await;
        self.emit(LedgerEvent::Changed).await;
        Ok(())
    }

    fn open_flat_backend(&mut self) {
        match FlatStore::open(&self.config.data_dir) {
            Ok(store) => {
                self.backend = Some(Box::new(store));
                self.mode = StorageMode::Flat;
            }
            Err(err) => {
                error!(error = %err, "flat store failed to open, running in-memory only");
                self.backend = None;
                self.mode = StorageMode::Memory;
            }
        }
    }

    fn enter_memory_mode(&mut self) {
        self.backend = None;
        self.mode = StorageMode::Memory;
        self.transactions.clear();
        self.categories = default_categories();
        self.filters = FilterState::default();
        self.stats = LedgerStats::default();
    }

    async fn load_persisted_state(&mut self) -> Result<(), BackendError> {
        let (transactions, settings) = match self.backend.as_deref() {
            Some(backend) => (
                backend.get_all_transactions().await?,
                backend.get_settings().await?,
            ),
            None => (Vec::new(), None),
        };
        self.transactions = transactions;
        self.invalidate_caches();
        match settings {
            Some(settings) => {
                self.categories = settings.categories;
                self.filters = settings.filters;
                self.stats = settings.stats;
            }
            None => {
                // First run against this backend: seed the registry.
                self.categories = default_categories();
                self.filters = FilterState::default();
                self.stats = LedgerStats::default();
                self.save_settings_now().await;
            }
        }
        Ok(())
    }

    /// Flush pending writes, close the backend, and drop every
    /// subscription. Terminal.
    pub async fn destroy(&mut self) {
        if self.state == LedgerState::Destroyed {
            return;
        }
        if self.settings_dirty {
            self.save_settings_now().await;
        }
        if let Some(backend) = self.backend.take() {
            if let Err(err) = backend.close().await {
                warn!(error = %err, "backend close failed");
            }
        }
        self.bus.clear();
        self.state = LedgerState::Destroyed;
        info!("ledger destroyed");
    }

    fn ensure_ready(&self) -> LedgerResult<()> {
        match self.state {
            LedgerState::Ready | LedgerState::DegradedReady => Ok(()),
            LedgerState::Destroyed => Err(LedgerError::Destroyed),
            LedgerState::Uninitialized | LedgerState::Initializing => {
                Err(LedgerError::NotInitialized)
            }
        }
    }

    // ---------------------------------------------------------------
    // Read surface
    // ---------------------------------------------------------------

    pub fn state(&self) -> LedgerState {
        self.state
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    /// True once a write to the active backend has failed this session;
    /// the in-memory state is authoritative and mirrored to the flat
    /// fallback until the next successful flush.
    pub fn durability_degraded(&self) -> bool {
        self.durability_degraded
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn categories(&self) -> &CategorySets {
        &self.categories
    }

    pub fn filters(&self) -> &FilterState {
        &self.filters
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats
    }

    /// Bus handle for subscribing to change events.
    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }

    /// The current filtered, date-descending view.
    pub fn filtered_view(&self) -> Vec<Transaction> {
        let mut view: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| self.filters.matches(t))
            .cloned()
            .collect();
        view.sort_by(|a, b| b.date.cmp(&a.date).then(b.created_at.cmp(&a.created_at)));
        view
    }

    // ---------------------------------------------------------------
    // Transaction mutations
    // ---------------------------------------------------------------

    /// Validate a draft and append it as a fresh record.
    pub async fn add_transaction(&mut self, draft: TransactionDraft) -> LedgerResult<Transaction> {
        self.ensure_ready()?;
        let clean = validate_draft(&draft, &self.categories)?;

        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            date: clean.date,
            kind: clean.kind,
            category: clean.category,
            amount: clean.amount,
            note: clean.note,
            created_at: now,
            updated_at: now,
        };

        self.transactions.push(transaction.clone());
        self.invalidate_caches();
        self.stats.lifetime_added += 1;

        let persisted = match self.backend.as_deref() {
            Some(backend) => backend.add_transaction(&transaction).await,
            None => Ok(()),
        };
        if let Err(err) = persisted {
            self.persistence_failure("add_transaction", err).await;
        }
        self.save_settings_debounced().await;

        if self.backups.note_additions(1) {
            self.write_backup().await;
        }

        self.emit(LedgerEvent::TransactionAdded(transaction.clone()))
            .await;
        self.emit(LedgerEvent::Changed).await;
        Ok(transaction)
    }

    /// Merge a patch onto an existing record and re-validate the merged
    /// result. The original creation timestamp is preserved.
    pub async fn update_transaction(
        &mut self,
        id: &str,
        patch: TransactionPatch,
    ) -> LedgerResult<Transaction> {
        self.ensure_ready()?;
        let index = self
            .transactions
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        let current = &self.transactions[index];
        let merged = TransactionDraft {
            date: patch
                .date
                .clone()
                .unwrap_or_else(|| current.date.format("%Y-%m-%d").to_string()),
            kind: patch.kind.unwrap_or(current.kind),
            category: patch
                .category
                .clone()
                .unwrap_or_else(|| current.category.clone()),
            amount: patch.amount.unwrap_or(current.amount),
            note: patch.note.clone().unwrap_or_else(|| current.note.clone()),
        };
        let clean = validate_draft(&merged, &self.categories)?;

        let updated = Transaction {
            id: current.id.clone(),
            date: clean.date,
            kind: clean.kind,
            category: clean.category,
            amount: clean.amount,
            note: clean.note,
            created_at: current.created_at,
            updated_at: Utc::now(),
        };
        self.transactions[index] = updated.clone();
        self.invalidate_caches();
        self.stats.lifetime_updated += 1;

        let persisted = match self.backend.as_deref() {
            Some(backend) => backend.update_transaction(&updated).await,
            None => Ok(()),
        };
        if let Err(err) = persisted {
            self.persistence_failure("update_transaction", err).await;
        }
        self.save_settings_debounced().await;

        self.emit(LedgerEvent::TransactionUpdated(updated.clone()))
            .await;
        self.emit(LedgerEvent::Changed).await;
        Ok(updated)
    }

    /// Remove a record if present. Deleting an absent id is a no-op,
    /// not an error; returns whether anything was removed.
    pub async fn delete_transaction(&mut self, id: &str) -> LedgerResult<bool> {
        self.ensure_ready()?;
        let before = self.transactions.len();
        self.transactions.retain(|t| t.id != id);
        if self.transactions.len() == before {
            debug!(id, "delete of absent transaction is a no-op");
            return Ok(false);
        }

        self.invalidate_caches();
        self.stats.lifetime_deleted += 1;

        let persisted = match self.backend.as_deref() {
            Some(backend) => backend.delete_transaction(id).await.map(|_| ()),
            None => Ok(()),
        };
        if let Err(err) = persisted {
            self.persistence_failure("delete_transaction", err).await;
        }
        self.save_settings_debounced().await;

        self.emit(LedgerEvent::TransactionDeleted { id: id.to_string() })
            .await;
        self.emit(LedgerEvent::Changed).await;
        Ok(true)
    }

    /// Validate every draft independently; commit the valid rows as one
    /// batch and report the rejects per row. Errors only when a
    /// non-empty input yields zero valid rows.
    pub async fn add_transactions_batch(
        &mut self,
        drafts: Vec<TransactionDraft>,
    ) -> LedgerResult<BatchOutcome> {
        self.ensure_ready()?;

        let mut row_errors = Vec::new();
        let mut clean_rows = Vec::new();
        for (row, draft) in drafts.iter().enumerate() {
            match validate_draft(draft, &self.categories) {
                Ok(clean) => clean_rows.push(clean),
                Err(errors) => row_errors.push(BatchRowError {
                    row,
                    errors: errors.errors,
                }),
            }
        }
        if clean_rows.is_empty() && !drafts.is_empty() {
            return Err(LedgerError::EmptyBatch(row_errors));
        }

        let now = Utc::now();
        let added: Vec<Transaction> = clean_rows
            .into_iter()
            .map(|clean| Transaction {
                id: Uuid::new_v4().to_string(),
                date: clean.date,
                kind: clean.kind,
                category: clean.category,
                amount: clean.amount,
                note: clean.note,
                created_at: now,
                updated_at: now,
            })
            .collect();

        if !added.is_empty() {
            self.transactions.extend(added.iter().cloned());
            self.invalidate_caches();
            self.stats.lifetime_added += added.len() as u64;

            let persisted = match self.backend.as_deref() {
                Some(backend) => backend.add_transactions_batch(&added).await,
                None => Ok(()),
            };
            if let Err(err) = persisted {
                self.persistence_failure("add_transactions_batch", err).await;
            }
            self.save_settings_debounced().await;

            if self.backups.note_additions(added.len() as u32) {
                self.write_backup().await;
            }

            self.emit(LedgerEvent::TransactionsBatchAdded { count: added.len() })
                .await;
            self.emit(LedgerEvent::Changed).await;
        }

        Ok(BatchOutcome {
            added,
            errors: row_errors,
        })
    }

    /// Empty the transaction collection. The category registry and
    /// lifetime stats are preserved.
    pub async fn clear_all(&mut self) -> LedgerResult<()> {
        self.ensure_ready()?;
        self.transactions.clear();
        self.invalidate_caches();

        let persisted = match self.backend.as_deref() {
            Some(backend) => backend.clear_transactions().await,
            None => Ok(()),
        };
        if let Err(err) = persisted {
            self.persistence_failure("clear_transactions", err).await;
        }

        self.emit(LedgerEvent::DataCleared).await;
        self.emit(LedgerEvent::Changed).await;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Filters and aggregates
    // ---------------------------------------------------------------

    /// Install a new filter, emit the recomputed view, and persist the
    /// selection into settings (debounced).
    pub async fn apply_filters(&mut self, filter: FilterState) -> LedgerResult<Vec<Transaction>> {
        self.ensure_ready()?;
        self.filters = filter;
        let view = self.filtered_view();
        self.save_settings_debounced().await;
        self.emit(LedgerEvent::FiltersApplied(view.clone())).await;
        Ok(view)
    }

    /// Totals, counts, and averages per kind. Cached against the
    /// transaction-count fingerprint; count-preserving mutations
    /// invalidate explicitly, so a hit is always fresh.
    pub fn calculate_summary(&mut self) -> Summary {
        let fingerprint = self.transactions.len();
        if let Some((cached_fingerprint, summary)) = &self.summary_cache {
            if *cached_fingerprint == fingerprint {
                return summary.clone();
            }
        }

        let mut summary = Summary {
            transaction_count: fingerprint,
            ..Summary::default()
        };
        for transaction in &self.transactions {
            match transaction.kind {
                TransactionKind::Income => {
                    summary.income += transaction.amount;
                    summary.income_count += 1;
                }
                TransactionKind::Expense => {
                    summary.expense += transaction.amount;
                    summary.expense_count += 1;
                }
            }
        }
        summary.balance = summary.income - summary.expense;
        if summary.income_count > 0 {
            summary.income_average = summary.income as f64 / summary.income_count as f64;
        }
        if summary.expense_count > 0 {
            summary.expense_average = summary.expense as f64 / summary.expense_count as f64;
        }

        self.summary_cache = Some((fingerprint, summary.clone()));
        summary
    }

    /// Per-month income/expense for the `month_count` calendar months
    /// ending at `end_date`'s month. Every month in the window is
    /// present, zero-filled when nothing matches. Cached per window.
    pub fn monthly_aggregate(
        &mut self,
        month_count: u32,
        end_date: NaiveDate,
    ) -> BTreeMap<String, MonthTotals> {
        let end_key = format!("{:04}-{:02}", end_date.year(), end_date.month());
        let cache_key = (month_count, end_key);
        if let Some(hit) = self.monthly_cache.get(&cache_key) {
            return hit.clone();
        }

        let mut months: BTreeMap<String, MonthTotals> = BTreeMap::new();
        let (mut year, mut month) = (end_date.year(), end_date.month());
        for _ in 0..month_count {
            months.insert(format!("{:04}-{:02}", year, month), MonthTotals::default());
            if month == 1 {
                year -= 1;
                month = 12;
            } else {
                month -= 1;
            }
        }

        for transaction in &self.transactions {
            if let Some(slot) = months.get_mut(&transaction.month_key()) {
                match transaction.kind {
                    TransactionKind::Income => slot.income += transaction.amount,
                    TransactionKind::Expense => slot.expense += transaction.amount,
                }
            }
        }

        self.monthly_cache.insert(cache_key, months.clone());
        months
    }

    fn invalidate_caches(&mut self) {
        self.summary_cache = None;
        self.monthly_cache.clear();
    }

    // ---------------------------------------------------------------
    // Category registry
    // ---------------------------------------------------------------

    /// Add a category name to the registry for `kind`.
    pub async fn add_category(
        &mut self,
        kind: TransactionKind,
        name: &str,
    ) -> LedgerResult<String> {
        self.ensure_ready()?;
        let clean = validate_category_name(name)?;
        if self.categories.contains(kind, &clean) {
            return Err(
                ValidationErrors::single("name", format!("category already exists: {}", clean))
                    .into(),
            );
        }
        self.categories.for_kind_mut(kind).push(clean.clone());
        self.save_settings_debounced().await;
        self.emit(LedgerEvent::CategoryAdded {
            kind,
            name: clean.clone(),
        })
        .await;
        Ok(clean)
    }

    /// Remove a category. When transactions still reference it, a
    /// `replacement` must be supplied; every affected transaction is
    /// reassigned through the normal update path — awaited, so a
    /// failure aborts before the name leaves the registry.
    pub async fn remove_category(
        &mut self,
        kind: TransactionKind,
        name: &str,
        replacement: Option<&str>,
    ) -> LedgerResult<()> {
        self.ensure_ready()?;
        let name = name.trim().to_string();
        if !self.categories.contains(kind, &name) {
            return Err(LedgerError::NotFound(format!("{} category {}", kind, name)));
        }

        let affected: Vec<String> = self
            .transactions
            .iter()
            .filter(|t| t.kind == kind && t.category == name)
            .map(|t| t.id.clone())
            .collect();

        if !affected.is_empty() {
            let replacement = match replacement {
                Some(replacement) => replacement.trim().to_string(),
                None => return Err(LedgerError::CategoryInUse(affected.len())),
            };
            if replacement == name || !self.categories.contains(kind, &replacement) {
                return Err(ValidationErrors::single(
                    "replacement",
                    format!("not a valid {} category: {}", kind, replacement),
                )
                .into());
            }
            for id in &affected {
                let patch = TransactionPatch {
                    category: Some(replacement.clone()),
                    ..TransactionPatch::default()
                };
                self.update_transaction(id, patch).await?;
            }
        }

        self.categories.for_kind_mut(kind).retain(|c| c != &name);
        self.save_settings_debounced().await;
        self.emit(LedgerEvent::CategoryRemoved { kind, name }).await;
        Ok(())
    }

    /// Rename a category in place, reassigning every referencing
    /// transaction and preserving the registry order.
    pub async fn rename_category(
        &mut self,
        kind: TransactionKind,
        old: &str,
        new: &str,
    ) -> LedgerResult<String> {
        self.ensure_ready()?;
        let old = old.trim().to_string();
        let clean = validate_category_name(new)?;

        let position = self
            .categories
            .for_kind(kind)
            .iter()
            .position(|c| c == &old)
            .ok_or_else(|| LedgerError::NotFound(format!("{} category {}", kind, old)))?;
        if self.categories.contains(kind, &clean) {
            return Err(
                ValidationErrors::single("name", format!("category already exists: {}", clean))
                    .into(),
            );
        }

        // The new name enters the registry first so the reassignments
        // validate against it; the old name leaves once they are done.
        self.categories
            .for_kind_mut(kind)
            .insert(position, clean.clone());

        let affected: Vec<String> = self
            .transactions
            .iter()
            .filter(|t| t.kind == kind && t.category == old)
            .map(|t| t.id.clone())
            .collect();
        for id in &affected {
            let patch = TransactionPatch {
                category: Some(clean.clone()),
                ..TransactionPatch::default()
            };
            self.update_transaction(id, patch).await?;
        }

        self.categories.for_kind_mut(kind).retain(|c| c != &old);
        self.save_settings_debounced().await;
        self.emit(LedgerEvent::CategoryAdded {
            kind,
            name: clean.clone(),
        })
        .await;
        self.emit(LedgerEvent::CategoryRemoved { kind, name: old })
            .await;
        Ok(clean)
    }

    // ---------------------------------------------------------------
    // Snapshot / restore / integrity
    // ---------------------------------------------------------------

    /// Full serialization of transactions, registry, and stats.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: Utc::now(),
            transactions: self.transactions.clone(),
            categories: self.categories.clone(),
            stats: self.stats,
        }
    }

    /// Replace the whole in-memory state from a snapshot and persist it.
    pub async fn restore(&mut self, snapshot: Snapshot) -> LedgerResult<()> {
        self.ensure_ready()?;
        info!(
            version = %snapshot.version,
            transactions = snapshot.transactions.len(),
            "restoring from snapshot"
        );
        self.transactions = snapshot.transactions;
        self.categories = snapshot.categories;
        self.stats = snapshot.stats;
        self.invalidate_caches();
        self.persist_full_state().await;
        self.emit(LedgerEvent::Loaded).await;
        self.emit(LedgerEvent::Changed).await;
        Ok(())
    }

    /// Diagnostic pass over the collection. Reports, never mutates.
    pub fn validate_integrity(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        let mut seen: HashSet<&str> = HashSet::new();
        for (index, transaction) in self.transactions.iter().enumerate() {
            if transaction.id.trim().is_empty() {
                report.issues.push(IntegrityIssue::MissingId { index });
            } else if !seen.insert(transaction.id.as_str()) {
                report.issues.push(IntegrityIssue::DuplicateId {
                    id: transaction.id.clone(),
                });
            }
            if !amount_in_range(transaction.amount) {
                report.issues.push(IntegrityIssue::InvalidAmount {
                    id: transaction.id.clone(),
                    amount: transaction.amount,
                });
            }
            if !date_in_range(transaction.date) {
                report.issues.push(IntegrityIssue::InvalidDate {
                    id: transaction.id.clone(),
                    date: transaction.date.to_string(),
                });
            }
            if transaction.note.chars().count() > MAX_NOTE_CHARS {
                report.issues.push(IntegrityIssue::OverlongNote {
                    id: transaction.id.clone(),
                    length: transaction.note.chars().count(),
                });
            }
            if !self
                .categories
                .contains(transaction.kind, &transaction.category)
            {
                report.issues.push(IntegrityIssue::OrphanCategory {
                    id: transaction.id.clone(),
                    kind: transaction.kind,
                    category: transaction.category.clone(),
                });
            }
        }
        report
    }

    /// Remove unrecoverable records and reassign orphaned categories to
    /// a synthesized default, reporting every action taken.
    pub async fn repair(&mut self) -> LedgerResult<Vec<RepairAction>> {
        self.ensure_ready()?;
        let mut actions = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut kept = Vec::new();

        for mut transaction in std::mem::take(&mut self.transactions) {
            if transaction.id.trim().is_empty() {
                actions.push(RepairAction::RemovedInvalid {
                    id: transaction.id,
                    reason: "empty id".to_string(),
                });
                continue;
            }
            if !seen.insert(transaction.id.clone()) {
                actions.push(RepairAction::RemovedDuplicate { id: transaction.id });
                continue;
            }
            if !amount_in_range(transaction.amount) {
                actions.push(RepairAction::RemovedInvalid {
                    id: transaction.id,
                    reason: format!("amount {} out of range", transaction.amount),
                });
                continue;
            }
            if !date_in_range(transaction.date) {
                actions.push(RepairAction::RemovedInvalid {
                    id: transaction.id,
                    reason: format!("date {} out of range", transaction.date),
                });
                continue;
            }
            if transaction.note.chars().count() > MAX_NOTE_CHARS {
                transaction.note = transaction.note.chars().take(MAX_NOTE_CHARS).collect();
                transaction.updated_at = Utc::now();
                actions.push(RepairAction::TruncatedNote {
                    id: transaction.id.clone(),
                });
            }
            if !self
                .categories
                .contains(transaction.kind, &transaction.category)
            {
                let default = self.ensure_default_category(transaction.kind, &mut actions);
                actions.push(RepairAction::ReassignedCategory {
                    id: transaction.id.clone(),
                    from: transaction.category.clone(),
                    to: default.clone(),
                });
                transaction.category = default;
                transaction.updated_at = Utc::now();
            }
            kept.push(transaction);
        }
        self.transactions = kept;

        if !actions.is_empty() {
            info!(actions = actions.len(), "repair pass rewrote the ledger");
            self.invalidate_caches();
            self.persist_full_state().await;
            self.emit(LedgerEvent::DataRepaired(actions.clone())).await;
            self.emit(LedgerEvent::Changed).await;
        }
        Ok(actions)
    }

    fn ensure_default_category(
        &mut self,
        kind: TransactionKind,
        actions: &mut Vec<RepairAction>,
    ) -> String {
        if !self.categories.contains(kind, DEFAULT_CATEGORY) {
            self.categories
                .for_kind_mut(kind)
                .push(DEFAULT_CATEGORY.to_string());
            actions.push(RepairAction::AddedDefaultCategory {
                kind,
                name: DEFAULT_CATEGORY.to_string(),
            });
        }
        DEFAULT_CATEGORY.to_string()
    }

    // ---------------------------------------------------------------
    // Backups
    // ---------------------------------------------------------------

    /// On-demand snapshot into the backend's backup area.
    pub async fn create_backup(&mut self) -> LedgerResult<()> {
        self.ensure_ready()?;
        self.write_backup().await;
        Ok(())
    }

    pub async fn latest_backup(&self) -> LedgerResult<Option<BackupRecord>> {
        self.ensure_ready()?;
        Ok(match self.backend.as_deref() {
            Some(backend) => backend.get_latest_backup().await?,
            None => None,
        })
    }

    async fn write_backup(&mut self) {
        let snapshot = self.snapshot();
        let keep = self.backups.keep();
        let result = match self.backend.as_deref() {
            Some(backend) => match backend.create_backup(&snapshot).await {
                Ok(()) => backend.prune_backups(keep).await,
                Err(err) => Err(err),
            },
            None => Ok(()),
        };
        match result {
            Ok(()) => debug!(transactions = snapshot.transactions.len(), "backup written"),
            Err(err) => warn!(error = %err, "backup write failed"),
        }
    }

    // ---------------------------------------------------------------
    // Persistence plumbing
    // ---------------------------------------------------------------

    /// Force any pending debounced settings write.
    pub async fn flush(&mut self) -> LedgerResult<()> {
        self.ensure_ready()?;
        if self.settings_dirty {
            self.save_settings_now().await;
        }
        Ok(())
    }

    fn settings_record(&self) -> SettingsRecord {
        SettingsRecord {
            categories: self.categories.clone(),
            filters: self.filters.clone(),
            stats: self.stats,
        }
    }

    /// Coalesce rapid settings changes: the first write goes straight
    /// through, later ones wait for the quiet interval (or a `flush`).
    async fn save_settings_debounced(&mut self) {
        self.settings_dirty = true;
        let due = match self.last_settings_write {
            None => true,
            Some(at) => at.elapsed() >= self.config.settings_debounce,
        };
        if due {
            self.save_settings_now().await;
        }
    }

    async fn save_settings_now(&mut self) {
        let settings = self.settings_record();
        let result = match self.backend.as_deref() {
            Some(backend) => backend.save_settings(&settings).await,
            None => Ok(()),
        };
        self.settings_dirty = false;
        self.last_settings_write = Some(Instant::now());
        if let Err(err) = result {
            self.persistence_failure("save_settings", err).await;
        }
    }

    /// Rewrite the backend's transaction collection and settings from
    /// the in-memory state.
    async fn persist_full_state(&mut self) {
        let result = match self.backend.as_deref() {
            Some(backend) => match backend.clear_transactions().await {
                Ok(()) => backend.add_transactions_batch(&self.transactions).await,
                Err(err) => Err(err),
            },
            None => Ok(()),
        };
        if let Err(err) = result {
            self.persistence_failure("replace_all", err).await;
        }
        self.save_settings_now().await;
    }

    /// A write to the active backend failed after the record was already
    /// applied in memory. The operation still succeeds — the user's data
    /// is not lost, only its durability is degraded — and the full state
    /// is mirrored to the flat fallback when the structured store is the
    /// one misbehaving.
    async fn persistence_failure(&mut self, op: &'static str, err: BackendError) {
        warn!(op, error = %err, "write to active backend failed, in-memory state remains authoritative");
        self.durability_degraded = true;
        self.mirror_to_fallback().await;
    }

    async fn mirror_to_fallback(&mut self) {
        if self.mode != StorageMode::Structured {
            return;
        }
        if self.fallback.is_none() {
            match FlatStore::open(&self.config.data_dir) {
                Ok(store) => self.fallback = Some(store),
                Err(err) => {
                    error!(error = %err, "flat fallback could not be opened");
                    return;
                }
            }
        }
        let settings = self.settings_record();
        if let Some(fallback) = &self.fallback {
            if let Err(err) = fallback.write_transactions(&self.transactions) {
                error!(error = %err, "flat fallback write failed");
                return;
            }
            if let Err(err) = fallback.save_settings(&settings).await {
                error!(error = %err, "flat fallback settings write failed");
            }
        }
    }

    async fn emit(&self, event: LedgerEvent) {
        self.bus.publish_and_await(event).await;
    }
}

fn default_categories() -> CategorySets {
    CategorySets {
        income: ["Salary", "Bonus", "Gift", "Other"]
            .into_iter()
            .map(String::from)
            .collect(),
        expense: [
            "Food",
            "Housing",
            "Utilities",
            "Transport",
            "Health",
            "Leisure",
            "Other",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn memdb_url() -> String {
        format!("sqlite:file:memdb_{}?mode=memory&cache=shared", Uuid::new_v4())
    }

    fn test_config(dir: &TempDir) -> LedgerConfig {
        LedgerConfig {
            database_url: Some(memdb_url()),
            settings_debounce: Duration::from_secs(60),
            ..LedgerConfig::with_data_dir(dir.path())
        }
    }

    async fn ready_ledger() -> (Ledger, TempDir) {
        let dir = tempdir().expect("Failed to create temp dir");
        let mut ledger = Ledger::new(test_config(&dir));
        ledger.initialize().await.expect("Failed to initialize");
        (ledger, dir)
    }

    /// A ledger whose structured store cannot open, forcing the flat
    /// fallback path.
    async fn degraded_ledger() -> (Ledger, TempDir) {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = LedgerConfig {
            database_url: Some("sqlite:/nonexistent-root/nope/ledger.db".to_string()),
            settings_debounce: Duration::from_secs(60),
            ..LedgerConfig::with_data_dir(dir.path())
        };
        let mut ledger = Ledger::new(config);
        ledger.initialize().await.expect("Failed to initialize");
        (ledger, dir)
    }

    fn draft(date: &str, kind: TransactionKind, category: &str, amount: i64) -> TransactionDraft {
        TransactionDraft {
            date: date.to_string(),
            kind,
            category: category.to_string(),
            amount,
            note: String::new(),
        }
    }

    fn income(date: &str, amount: i64) -> TransactionDraft {
        draft(date, TransactionKind::Income, "Salary", amount)
    }

    fn expense(date: &str, amount: i64) -> TransactionDraft {
        draft(date, TransactionKind::Expense, "Food", amount)
    }

    #[tokio::test]
    async fn add_stores_the_sanitized_record_with_a_fresh_id() {
        let (mut ledger, _dir) = ready_ledger().await;
        let mut d = income("2025-01-10", 300_000);
        d.note = "  padded note  ".to_string();

        let tx = ledger.add_transaction(d).await.expect("add");
        assert!(!tx.id.is_empty());
        assert_eq!(tx.note, "padded note");
        assert_eq!(tx.created_at, tx.updated_at);

        let all = ledger.transactions();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], tx);
    }

    #[tokio::test]
    async fn add_rejects_invalid_drafts_without_mutating() {
        let (mut ledger, _dir) = ready_ledger().await;
        let err = ledger
            .add_transaction(draft("2025-01-10", TransactionKind::Income, "Salary", 0))
            .await
            .expect_err("zero amount must fail");
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(ledger.transactions().is_empty());
        assert_eq!(ledger.stats().lifetime_added, 0);
    }

    #[tokio::test]
    async fn summary_scenario() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(income("2025-01-10", 300_000))
            .await
            .expect("add income");
        ledger
            .add_transaction(expense("2025-01-11", 1_500))
            .await
            .expect("add expense");

        let summary = ledger.calculate_summary();
        assert_eq!(summary.income, 300_000);
        assert_eq!(summary.expense, 1_500);
        assert_eq!(summary.balance, 298_500);
        assert_eq!(summary.transaction_count, 2);
        assert_eq!(summary.income_count, 1);
        assert_eq!(summary.expense_count, 1);
    }

    #[tokio::test]
    async fn summary_cache_survives_reads_but_not_updates() {
        let (mut ledger, _dir) = ready_ledger().await;
        let tx = ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect("add");

        assert_eq!(ledger.calculate_summary().income, 100);
        // Count-preserving mutation must still invalidate.
        ledger
            .update_transaction(
                &tx.id,
                TransactionPatch {
                    amount: Some(250),
                    ..TransactionPatch::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(ledger.calculate_summary().income, 250);
    }

    #[tokio::test]
    async fn monthly_aggregate_scenario() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(income("2025-01-10", 300_000))
            .await
            .expect("add");
        ledger
            .add_transaction(expense("2025-01-11", 1_500))
            .await
            .expect("add");

        let window = ledger.monthly_aggregate(1, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
        assert_eq!(window.len(), 1);
        let january = window.get("2025-01").expect("January present");
        assert_eq!(january.income, 300_000);
        assert_eq!(january.expense, 1_500);
    }

    #[tokio::test]
    async fn monthly_aggregate_zero_fills_the_window() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(expense("2025-02-10", 900))
            .await
            .expect("add");

        let window = ledger.monthly_aggregate(3, NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
        let keys: Vec<&String> = window.keys().collect();
        assert_eq!(keys, vec!["2024-12", "2025-01", "2025-02"]);
        assert_eq!(window["2024-12"], MonthTotals::default());
        assert_eq!(window["2025-01"], MonthTotals::default());
        assert_eq!(window["2025-02"].expense, 900);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (mut ledger, _dir) = ready_ledger().await;
        let tx = ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect("add");

        assert!(ledger.delete_transaction(&tx.id).await.expect("delete"));
        let after_first = ledger.transactions().to_vec();
        assert!(!ledger.delete_transaction(&tx.id).await.expect("delete"));
        assert_eq!(ledger.transactions(), after_first.as_slice());
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let (mut ledger, _dir) = ready_ledger().await;
        let first = ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect("add");
        ledger
            .delete_transaction(&first.id)
            .await
            .expect("delete");
        let second = ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect("re-add");
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn update_merges_and_revalidates() {
        let (mut ledger, _dir) = ready_ledger().await;
        let tx = ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect("add");

        // Invalid merged result: amount drops below the floor.
        let err = ledger
            .update_transaction(
                &tx.id,
                TransactionPatch {
                    amount: Some(0),
                    ..TransactionPatch::default()
                },
            )
            .await
            .expect_err("must fail");
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(ledger.transactions()[0].amount, 100);

        // Valid patch keeps creation time, bumps updated_at.
        let updated = ledger
            .update_transaction(
                &tx.id,
                TransactionPatch {
                    note: Some("groceries run".to_string()),
                    ..TransactionPatch::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.created_at, tx.created_at);
        assert!(updated.updated_at >= tx.updated_at);
        assert_eq!(updated.amount, 100);
        assert_eq!(updated.note, "groceries run");
    }

    #[tokio::test]
    async fn update_of_missing_id_is_not_found() {
        let (mut ledger, _dir) = ready_ledger().await;
        let err = ledger
            .update_transaction("no-such-id", TransactionPatch::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_commits_valid_rows_and_reports_rejects() {
        let (mut ledger, _dir) = ready_ledger().await;
        let outcome = ledger
            .add_transactions_batch(vec![
                income("2025-01-10", 100),
                draft("2025-01-11", TransactionKind::Expense, "Food", -5),
                expense("2025-01-12", 200),
            ])
            .await
            .expect("batch");

        assert_eq!(outcome.added.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].row, 1);
        assert_eq!(ledger.transactions().len(), 2);
    }

    #[tokio::test]
    async fn batch_with_zero_valid_rows_errors() {
        let (mut ledger, _dir) = ready_ledger().await;
        let err = ledger
            .add_transactions_batch(vec![
                draft("2025-01-10", TransactionKind::Income, "Salary", 0),
                draft("bad-date", TransactionKind::Expense, "Food", 10),
            ])
            .await
            .expect_err("must fail");
        match err {
            LedgerError::EmptyBatch(rows) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(ledger.transactions().is_empty());

        // An empty input is fine: nothing to reject, nothing to add.
        let outcome = ledger
            .add_transactions_batch(Vec::new())
            .await
            .expect("empty batch");
        assert!(outcome.added.is_empty() && outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn filters_produce_a_sorted_conjunctive_view() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect("add");
        ledger
            .add_transaction(expense("2025-01-20", 50))
            .await
            .expect("add");
        ledger
            .add_transaction(expense("2025-02-05", 75))
            .await
            .expect("add");

        let view = ledger
            .apply_filters(FilterState {
                kind: Some(TransactionKind::Expense),
                category: None,
                month: None,
            })
            .await
            .expect("filter");
        let dates: Vec<String> = view.iter().map(|t| t.date.to_string()).collect();
        assert_eq!(dates, vec!["2025-02-05", "2025-01-20"]);

        let monthly = ledger
            .apply_filters(FilterState {
                kind: Some(TransactionKind::Expense),
                category: Some("Food".to_string()),
                month: Some("2025-01".to_string()),
            })
            .await
            .expect("filter");
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].amount, 50);
    }

    #[tokio::test]
    async fn category_in_use_blocks_removal_without_replacement() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(expense("2025-01-10", 10))
            .await
            .expect("add");
        ledger
            .add_transaction(expense("2025-01-11", 20))
            .await
            .expect("add");

        let err = ledger
            .remove_category(TransactionKind::Expense, "Food", None)
            .await
            .expect_err("must fail");
        match err {
            LedgerError::CategoryInUse(count) => assert_eq!(count, 2),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(ledger.categories().contains(TransactionKind::Expense, "Food"));
        assert!(ledger.transactions().iter().all(|t| t.category == "Food"));
    }

    #[tokio::test]
    async fn remove_category_with_replacement_reassigns_every_reference() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(expense("2025-01-10", 10))
            .await
            .expect("add");
        ledger
            .add_transaction(expense("2025-01-11", 20))
            .await
            .expect("add");

        ledger
            .remove_category(TransactionKind::Expense, "Food", Some("Other"))
            .await
            .expect("remove with replacement");

        assert!(!ledger.categories().contains(TransactionKind::Expense, "Food"));
        assert!(ledger
            .transactions()
            .iter()
            .all(|t| t.category == "Other"));
        // Unused category removal needs no replacement.
        ledger
            .remove_category(TransactionKind::Expense, "Housing", None)
            .await
            .expect("remove unused");
    }

    #[tokio::test]
    async fn rename_category_preserves_order_and_reassigns() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(expense("2025-01-10", 10))
            .await
            .expect("add");

        let position_before = ledger
            .categories()
            .expense
            .iter()
            .position(|c| c == "Food")
            .expect("Food present");

        ledger
            .rename_category(TransactionKind::Expense, "Food", "Groceries")
            .await
            .expect("rename");

        let expense_set = &ledger.categories().expense;
        assert_eq!(expense_set[position_before], "Groceries");
        assert!(!expense_set.iter().any(|c| c == "Food"));
        assert_eq!(ledger.transactions()[0].category, "Groceries");
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(income("2025-01-10", 300_000))
            .await
            .expect("add");
        ledger
            .add_transaction(expense("2025-01-11", 1_500))
            .await
            .expect("add");
        ledger
            .add_category(TransactionKind::Expense, "Books")
            .await
            .expect("category");

        let snapshot = ledger.snapshot();
        let transactions_before = ledger.transactions().to_vec();
        let categories_before = ledger.categories().clone();
        let stats_before = ledger.stats();

        ledger.clear_all().await.expect("clear");
        assert!(ledger.transactions().is_empty());

        ledger.restore(snapshot).await.expect("restore");
        assert_eq!(ledger.transactions(), transactions_before.as_slice());
        assert_eq!(ledger.categories(), &categories_before);
        assert_eq!(ledger.stats(), stats_before);
    }

    #[tokio::test]
    async fn structured_open_failure_degrades_to_flat_but_keeps_working() {
        let (mut ledger, dir) = degraded_ledger().await;
        assert_eq!(ledger.state(), LedgerState::DegradedReady);
        assert_eq!(ledger.storage_mode(), StorageMode::Flat);

        ledger
            .add_transaction(income("2025-01-10", 500))
            .await
            .expect("add in degraded mode");

        // A second instance over the same directory sees the data, so
        // the fallback really did persist it.
        let config = LedgerConfig {
            database_url: Some("sqlite:/nonexistent-root/nope/ledger.db".to_string()),
            ..LedgerConfig::with_data_dir(dir.path())
        };
        let mut reopened = Ledger::new(config);
        reopened.initialize().await.expect("reopen");
        assert_eq!(reopened.transactions().len(), 1);
        assert_eq!(reopened.transactions()[0].amount, 500);
    }

    #[tokio::test]
    async fn both_backends_failing_still_initializes_in_memory() {
        let dir = tempdir().expect("Failed to create temp dir");
        // Block the flat store by occupying its directory path with a file.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").expect("write blocker");

        let config = LedgerConfig {
            database_url: Some("sqlite:/nonexistent-root/nope/ledger.db".to_string()),
            ..LedgerConfig::with_data_dir(&blocker)
        };
        let mut ledger = Ledger::new(config);
        ledger.initialize().await.expect("initialize");

        assert_eq!(ledger.state(), LedgerState::DegradedReady);
        assert_eq!(ledger.storage_mode(), StorageMode::Memory);
        ledger
            .add_transaction(income("2025-01-10", 42))
            .await
            .expect("in-memory add");
        assert_eq!(ledger.transactions().len(), 1);
    }

    #[tokio::test]
    async fn structured_write_failure_mirrors_state_to_the_flat_fallback() {
        let dir = tempdir().expect("Failed to create temp dir");
        let url = memdb_url();
        let config = LedgerConfig {
            database_url: Some(url.clone()),
            settings_debounce: Duration::from_secs(60),
            ..LedgerConfig::with_data_dir(dir.path())
        };
        let mut ledger = Ledger::new(config);
        ledger.initialize().await.expect("initialize");
        assert_eq!(ledger.storage_mode(), StorageMode::Structured);

        // Sabotage the shared in-memory database out from under the
        // ledger so its next insert fails.
        let saboteur = sqlx::SqlitePool::connect(&url).await.expect("connect");
        sqlx::query("DROP TABLE transactions")
            .execute(&saboteur)
            .await
            .expect("drop table");

        let tx = ledger
            .add_transaction(income("2025-01-10", 777))
            .await
            .expect("add must still succeed");
        assert!(ledger.durability_degraded());
        assert_eq!(ledger.transactions().len(), 1);

        let fallback = FlatStore::open(dir.path()).expect("open fallback");
        let mirrored = fallback
            .get_all_transactions()
            .await
            .expect("read fallback");
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].id, tx.id);
    }

    #[tokio::test]
    async fn events_are_emitted_in_contract_order() {
        let (mut ledger, _dir) = ready_ledger().await;
        let seen: Arc<Mutex<Vec<Topic>>> = Arc::new(Mutex::new(Vec::new()));
        let bus = ledger.events();
        for topic in [
            Topic::TransactionAdded,
            Topic::TransactionDeleted,
            Topic::Changed,
            Topic::FiltersApplied,
        ] {
            let seen = seen.clone();
            bus.subscribe_fn(topic, move |event| {
                seen.lock().unwrap().push(event.topic());
                Ok(())
            });
        }

        let tx = ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect("add");
        ledger.delete_transaction(&tx.id).await.expect("delete");
        ledger
            .apply_filters(FilterState::default())
            .await
            .expect("filters");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Topic::TransactionAdded,
                Topic::Changed,
                Topic::TransactionDeleted,
                Topic::Changed,
                Topic::FiltersApplied,
            ]
        );
    }

    #[tokio::test]
    async fn clear_all_empties_but_keeps_the_registry() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect("add");
        let categories_before = ledger.categories().clone();

        ledger.clear_all().await.expect("clear");
        assert!(ledger.transactions().is_empty());
        assert_eq!(ledger.categories(), &categories_before);
        assert_eq!(ledger.calculate_summary().transaction_count, 0);
    }

    #[tokio::test]
    async fn integrity_and_repair_handle_a_damaged_snapshot() {
        // Flat mode so the damaged restore persists without unique-key
        // complaints from SQLite.
        let (mut ledger, _dir) = degraded_ledger().await;
        let now = Utc::now();
        let good = Transaction {
            id: "good".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            kind: TransactionKind::Income,
            category: "Salary".to_string(),
            amount: 100,
            note: String::new(),
            created_at: now,
            updated_at: now,
        };
        let duplicate = Transaction {
            id: "good".to_string(),
            ..good.clone()
        };
        let bad_amount = Transaction {
            id: "bad-amount".to_string(),
            amount: 0,
            ..good.clone()
        };
        let orphan = Transaction {
            id: "orphan".to_string(),
            category: "Ghost".to_string(),
            ..good.clone()
        };

        ledger
            .restore(Snapshot {
                version: SNAPSHOT_VERSION.to_string(),
                timestamp: now,
                transactions: vec![good.clone(), duplicate, bad_amount, orphan],
                categories: default_categories(),
                stats: LedgerStats::default(),
            })
            .await
            .expect("restore");

        let report = ledger.validate_integrity();
        assert!(!report.is_clean());
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, IntegrityIssue::DuplicateId { id } if id == "good")));
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, IntegrityIssue::InvalidAmount { id, .. } if id == "bad-amount")));
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, IntegrityIssue::OrphanCategory { id, .. } if id == "orphan")));

        let actions = ledger.repair().await.expect("repair");
        assert!(actions
            .iter()
            .any(|a| matches!(a, RepairAction::RemovedDuplicate { id } if id == "good")));
        assert!(actions
            .iter()
            .any(|a| matches!(a, RepairAction::RemovedInvalid { id, .. } if id == "bad-amount")));
        assert!(actions
            .iter()
            .any(|a| matches!(a, RepairAction::AddedDefaultCategory { kind, .. }
                if *kind == TransactionKind::Income)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, RepairAction::ReassignedCategory { id, to, .. }
                if id == "orphan" && to == DEFAULT_CATEGORY)));

        assert!(ledger.validate_integrity().is_clean());
        let ids: Vec<&str> = ledger.transactions().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["good", "orphan"]);
        // Repairing a clean ledger does nothing.
        assert!(ledger.repair().await.expect("repair").is_empty());
    }

    #[tokio::test]
    async fn auto_backup_runs_every_kth_addition_and_prunes() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = LedgerConfig {
            backup_every: 2,
            backup_keep: 2,
            ..test_config(&dir)
        };
        let mut ledger = Ledger::new(config);
        ledger.initialize().await.expect("initialize");

        for day in 1..=5 {
            ledger
                .add_transaction(income(&format!("2025-01-{:02}", day), 100))
                .await
                .expect("add");
        }

        // Backups fired after the 2nd and 4th additions.
        let latest = ledger
            .latest_backup()
            .await
            .expect("latest")
            .expect("backup present");
        assert_eq!(latest.payload.transactions.len(), 4);

        ledger.create_backup().await.expect("manual backup");
        let latest = ledger
            .latest_backup()
            .await
            .expect("latest")
            .expect("backup present");
        assert_eq!(latest.payload.transactions.len(), 5);
    }

    #[tokio::test]
    async fn settings_writes_are_debounced_until_flush() {
        let (mut ledger, dir) = degraded_ledger().await;

        let filter_a = FilterState {
            kind: Some(TransactionKind::Income),
            ..FilterState::default()
        };
        let filter_b = FilterState {
            kind: Some(TransactionKind::Expense),
            ..FilterState::default()
        };
        // Initialization just wrote the seeded settings, so both of
        // these rapid changes coalesce behind the debounce interval.
        ledger.apply_filters(filter_a).await.expect("filter a");
        ledger.apply_filters(filter_b.clone()).await.expect("filter b");

        let observer = FlatStore::open(dir.path()).expect("open observer");
        let persisted = observer
            .get_settings()
            .await
            .expect("read settings")
            .expect("settings present");
        assert_eq!(persisted.filters, FilterState::default());

        ledger.flush().await.expect("flush");
        let persisted = observer
            .get_settings()
            .await
            .expect("read settings")
            .expect("settings present");
        assert_eq!(persisted.filters, filter_b);
    }

    #[tokio::test]
    async fn settings_survive_a_reopen() {
        let (mut ledger, dir) = degraded_ledger().await;
        ledger
            .add_category(TransactionKind::Expense, "Books")
            .await
            .expect("category");
        ledger.destroy().await;

        let config = LedgerConfig {
            database_url: Some("sqlite:/nonexistent-root/nope/ledger.db".to_string()),
            ..LedgerConfig::with_data_dir(dir.path())
        };
        let mut reopened = Ledger::new(config);
        reopened.initialize().await.expect("reopen");
        assert!(reopened
            .categories()
            .contains(TransactionKind::Expense, "Books"));
    }

    #[tokio::test]
    async fn destroyed_ledger_rejects_everything() {
        let (mut ledger, _dir) = ready_ledger().await;
        ledger.destroy().await;
        assert_eq!(ledger.state(), LedgerState::Destroyed);

        let err = ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect_err("must fail");
        assert!(matches!(err, LedgerError::Destroyed));
        assert!(matches!(
            ledger.flush().await.expect_err("must fail"),
            LedgerError::Destroyed
        ));
        assert!(matches!(
            ledger.initialize().await.expect_err("must fail"),
            LedgerError::Destroyed
        ));
        // Destroy is itself idempotent.
        ledger.destroy().await;
    }

    #[tokio::test]
    async fn uninitialized_ledger_rejects_mutations() {
        let dir = tempdir().expect("Failed to create temp dir");
        let mut ledger = Ledger::new(test_config(&dir));
        let err = ledger
            .add_transaction(income("2025-01-10", 100))
            .await
            .expect_err("must fail");
        assert!(matches!(err, LedgerError::NotInitialized));
    }
}
