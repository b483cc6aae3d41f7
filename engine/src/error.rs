//! Error taxonomy for the ledger engine.
//!
//! Everything here is recoverable by the caller: validation failures carry
//! the full list of field errors, `CategoryInUse` carries the affected
//! count so the caller can prompt for a replacement, and backend failures
//! are only surfaced when every fallback has been exhausted.

use shared::{BatchRowError, FieldError};
use std::fmt;
use thiserror::Error;

use crate::storage::BackendError;

/// Field-level validation failures. No mutation has been performed when
/// one of these is returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, message);
        errors
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert into a result, erring when any field failed.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed:")?;
        for error in &self.errors {
            write!(f, " [{}: {}]", error.field, error.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Errors surfaced by the ledger's public contract.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("transaction not found: {0}")]
    NotFound(String),

    #[error("category is referenced by {0} transaction(s)")]
    CategoryInUse(usize),

    #[error("no valid rows in batch ({} rejected)", .0.len())]
    EmptyBatch(Vec<BatchRowError>),

    #[error("ledger is not initialized")]
    NotInitialized,

    #[error("ledger has been destroyed")]
    Destroyed,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
