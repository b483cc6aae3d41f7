//! Domain layer: the ledger itself plus the pure helpers it leans on.
//!
//! - **ledger**: orchestrates storage selection and fallback, owns the
//!   in-memory transaction collection, the category registry, the
//!   derived-aggregate caches, and emits change events.
//! - **validate**: pure sanitization/validation of raw input.
//! - **backup**: cadence/retention policy for automatic snapshots.

pub mod backup;
pub mod ledger;
pub mod validate;
