//! Sanitization and validation of raw ledger input.
//!
//! Pure functions: raw draft in, canonical values or the full list of
//! field errors out. Nothing here touches storage or engine state; the
//! category registry is passed in by the caller.

use chrono::{Datelike, NaiveDate};
use shared::{CategorySets, TransactionDraft, TransactionKind};

use crate::error::ValidationErrors;

pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 2100;
pub const MIN_AMOUNT: i64 = 1;
pub const MAX_AMOUNT: i64 = 99_999_999;
pub const MAX_NOTE_CHARS: usize = 200;
pub const MAX_CATEGORY_CHARS: usize = 50;

/// A draft that passed validation, with every field in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanDraft {
    pub date: NaiveDate,
    pub kind: TransactionKind,
    pub category: String,
    pub amount: i64,
    pub note: String,
}

/// Validate a draft against the field rules and the category registry.
///
/// Collects every failure rather than stopping at the first one, so a
/// form can mark all offending fields in a single round trip.
pub fn validate_draft(
    draft: &TransactionDraft,
    categories: &CategorySets,
) -> Result<CleanDraft, ValidationErrors> {
    let mut errors = ValidationErrors::new();

    let date = match parse_entry_date(draft.date.trim()) {
        Ok(date) => Some(date),
        Err(message) => {
            errors.push("date", message);
            None
        }
    };

    let category = draft.category.trim().to_string();
    if category.is_empty() {
        errors.push("category", "category is required");
    } else if !categories.contains(draft.kind, &category) {
        errors.push(
            "category",
            format!("unknown {} category: {}", draft.kind, category),
        );
    }

    if draft.amount < MIN_AMOUNT {
        errors.push("amount", format!("must be at least {}", MIN_AMOUNT));
    } else if draft.amount > MAX_AMOUNT {
        errors.push("amount", format!("must be at most {}", MAX_AMOUNT));
    }

    let note = draft.note.trim().to_string();
    if note.chars().count() > MAX_NOTE_CHARS {
        errors.push(
            "note",
            format!("must be at most {} characters", MAX_NOTE_CHARS),
        );
    }

    errors.into_result()?;

    Ok(CleanDraft {
        date: date.expect("date validated above"),
        kind: draft.kind,
        category,
        amount: draft.amount,
        note,
    })
}

/// Parse an ISO `YYYY-MM-DD` string and range-check the year.
pub fn parse_entry_date(raw: &str) -> Result<NaiveDate, String> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("not a valid ISO date: {:?}", raw))?;
    if !date_in_range(date) {
        return Err(format!(
            "year must be between {} and {}",
            MIN_YEAR, MAX_YEAR
        ));
    }
    Ok(date)
}

pub fn date_in_range(date: NaiveDate) -> bool {
    (MIN_YEAR..=MAX_YEAR).contains(&date.year())
}

pub fn amount_in_range(amount: i64) -> bool {
    (MIN_AMOUNT..=MAX_AMOUNT).contains(&amount)
}

/// Validate and canonicalize a category name.
pub fn validate_category_name(raw: &str) -> Result<String, ValidationErrors> {
    let name = raw.trim().to_string();
    let mut errors = ValidationErrors::new();

    if name.is_empty() {
        errors.push("name", "category name is required");
    } else {
        if name.chars().count() > MAX_CATEGORY_CHARS {
            errors.push(
                "name",
                format!("must be at most {} characters", MAX_CATEGORY_CHARS),
            );
        }
        if let Some(bad) = name.chars().find(|c| !is_category_char(*c)) {
            errors.push("name", format!("contains unsupported character {:?}", bad));
        }
    }

    errors.into_result()?;
    Ok(name)
}

fn is_category_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '&' | '/' | '(' | ')')
}
