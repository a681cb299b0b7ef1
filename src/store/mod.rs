//! Persistence backends for consumer state records.
//!
//! A backend is a versioned key-value store keyed by `(kind, name)`. The
//! three primitives are exactly what the state manager needs for atomic
//! create-or-get and single-writer-per-name updates: a plain load, an
//! insert-if-absent, and a compare-and-swap on the record version.

mod memory;
mod postgres;

pub use memory::InMemoryOffsetStore;
pub use postgres::PostgresOffsetStore;

use async_trait::async_trait;

use crate::error::Result;

/// A stored record revision.
#[derive(Debug, Clone)]
pub struct StoredState {
    /// Revision counter, starts at 0 on insert and increments on every swap.
    pub version: u64,
    /// The serialized state record.
    pub value: serde_json::Value,
}

/// Durable storage for named state records.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Fetch the current revision, or `None` when the record does not exist.
    async fn load(&self, kind: &str, name: &str) -> Result<Option<StoredState>>;

    /// Insert the record at version 0 if it does not exist yet.
    ///
    /// Atomic per `(kind, name)`: of two racing callers exactly one observes
    /// `true`, and afterwards both see the same stored record.
    async fn try_insert(&self, kind: &str, name: &str, value: &serde_json::Value) -> Result<bool>;

    /// Replace the record if its stored version still equals
    /// `expected_version`, bumping the version by one. Returns whether the
    /// swap happened.
    async fn compare_and_swap(
        &self,
        kind: &str,
        name: &str,
        expected_version: u64,
        value: &serde_json::Value,
    ) -> Result<bool>;
}
