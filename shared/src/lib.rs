//! Shared data model for the homeledger workspace.
//!
//! These types cross the boundary between the ledger engine and its
//! collaborators (table/chart/summary widgets, import/export tooling).
//! They are plain serde-serializable data; all behavior that mutates or
//! validates them lives in the engine crate.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot format version, bumped on incompatible layout changes.
pub const SNAPSHOT_VERSION: &str = "1.0.0";

/// Whether a transaction adds to or subtracts from the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Income,
    Expense,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
        }
    }

    /// Parse the lowercase storage representation back into a kind.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "income" => Some(TransactionKind::Income),
            "expense" => Some(TransactionKind::Expense),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single dated ledger entry.
///
/// The `id` is opaque and unique for the lifetime of the ledger; all other
/// fields are mutable through the validated update path only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    /// Calendar date of the entry (no time component).
    pub date: NaiveDate,
    pub kind: TransactionKind,
    /// Category name; must exist in the registry for `kind`.
    pub category: String,
    /// Amount in integer currency units, always positive.
    pub amount: i64,
    /// Free-form note, at most 200 characters.
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// The `YYYY-MM` bucket this transaction falls into.
    pub fn month_key(&self) -> String {
        format!("{:04}-{:02}", self.date.year(), self.date.month())
    }
}

/// Raw input for creating a transaction, before sanitization.
///
/// The date arrives as an ISO `YYYY-MM-DD` string straight from whatever
/// form or importer produced it; the engine parses and range-checks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub date: String,
    pub kind: TransactionKind,
    pub category: String,
    pub amount: i64,
    #[serde(default)]
    pub note: String,
}

/// Partial update to an existing transaction. `None` fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionPatch {
    pub date: Option<String>,
    pub kind: Option<TransactionKind>,
    pub category: Option<String>,
    pub amount: Option<i64>,
    pub note: Option<String>,
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.kind.is_none()
            && self.category.is_none()
            && self.amount.is_none()
            && self.note.is_none()
    }
}

/// Conjunctive view filter. Does not mutate stored data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub kind: Option<TransactionKind>,
    pub category: Option<String>,
    /// `YYYY-MM` month selector.
    pub month: Option<String>,
}

impl FilterState {
    pub fn matches(&self, transaction: &Transaction) -> bool {
        if let Some(kind) = self.kind {
            if transaction.kind != kind {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if &transaction.category != category {
                return false;
            }
        }
        if let Some(month) = &self.month {
            if &transaction.month_key() != month {
                return false;
            }
        }
        true
    }
}

/// Ordered category names, one set per transaction kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorySets {
    pub income: Vec<String>,
    pub expense: Vec<String>,
}

impl CategorySets {
    pub fn for_kind(&self, kind: TransactionKind) -> &Vec<String> {
        match kind {
            TransactionKind::Income => &self.income,
            TransactionKind::Expense => &self.expense,
        }
    }

    pub fn for_kind_mut(&mut self, kind: TransactionKind) -> &mut Vec<String> {
        match kind {
            TransactionKind::Income => &mut self.income,
            TransactionKind::Expense => &mut self.expense,
        }
    }

    pub fn contains(&self, kind: TransactionKind, name: &str) -> bool {
        self.for_kind(kind).iter().any(|c| c == name)
    }
}

/// Lifetime counters carried in settings and snapshots.
///
/// These only ever grow, which makes them a cheap way to tell two ledgers
/// with identical transaction sets apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub lifetime_added: u64,
    pub lifetime_updated: u64,
    pub lifetime_deleted: u64,
}

/// Non-transaction persisted state, stored independently of the
/// transaction collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsRecord {
    pub categories: CategorySets,
    pub filters: FilterState,
    pub stats: LedgerStats,
}

/// Aggregated totals over the whole transaction collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub income: i64,
    pub expense: i64,
    pub balance: i64,
    pub transaction_count: usize,
    pub income_count: usize,
    pub expense_count: usize,
    pub income_average: f64,
    pub expense_average: f64,
}

/// Accumulated income/expense for one calendar month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MonthTotals {
    pub income: i64,
    pub expense: i64,
}

/// Full serialized ledger state, produced by `snapshot()` and consumed by
/// `restore()`, export/import collaborators, and the backup area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<Transaction>,
    pub categories: CategorySets,
    pub stats: LedgerStats,
}

/// One entry in the capped backup log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub payload: Snapshot,
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Validation failures for one rejected row of a batch add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRowError {
    pub row: usize,
    pub errors: Vec<FieldError>,
}

/// Result of a batch add: committed rows plus per-row rejections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub added: Vec<Transaction>,
    pub errors: Vec<BatchRowError>,
}

/// A problem found by the integrity pass. Reported, never acted on, until
/// `repair()` is asked to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    MissingId { index: usize },
    DuplicateId { id: String },
    InvalidAmount { id: String, amount: i64 },
    InvalidDate { id: String, date: String },
    OverlongNote { id: String, length: usize },
    OrphanCategory { id: String, kind: TransactionKind, category: String },
}

/// Report produced by the integrity pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// One action taken by `repair()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    RemovedDuplicate { id: String },
    RemovedInvalid { id: String, reason: String },
    TruncatedNote { id: String },
    ReassignedCategory { id: String, from: String, to: String },
    AddedDefaultCategory { kind: TransactionKind, name: String },
}
