//! # homeledger engine
//!
//! The local persistent ledger engine behind homeledger: it owns the
//! transaction records and category registry, enforces their invariants,
//! persists them across two interchangeable storage backends with
//! automatic fallback, maintains derived aggregates with explicit
//! invalidation, and publishes change notifications to any number of
//! independent observers.
//!
//! UI collaborators call [`Ledger`] mutation methods; the ledger
//! validates, mutates its in-memory state, invalidates caches, persists
//! asynchronously to the active backend, and emits an event. Observers
//! re-read derived state when the event arrives. Nothing in this crate
//! renders, parses import formats, or talks to a network.

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod storage;

pub use config::LedgerConfig;
pub use domain::ledger::{Ledger, LedgerState, StorageMode, DEFAULT_CATEGORY};
pub use error::{LedgerError, LedgerResult, ValidationErrors};
pub use events::{EventBus, LedgerEvent, SubscriptionId, Topic};
pub use storage::{BackendError, BackendKind, StorageBackend};
