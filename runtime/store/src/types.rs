use std::future::Future;

use serde::{Deserialize, Serialize};

/// A stored value together with the version it was committed at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<V> {
    /// Starts at 1 on insert and increases by one per committed write.
    pub version: u64,
    pub value: V,
}

impl<V> Versioned<V> {
    pub fn new(version: u64, value: V) -> Self {
        Self { version, value }
    }
}

/// Result of a conditional write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied; the key now holds `version`.
    Committed { version: u64 },
    /// Someone else wrote first. Nothing was changed.
    Conflict { current_version: u64 },
}

impl CasOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CasOutcome::Committed { .. })
    }
}

/// Errors produced by a store backend.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A key/value store offering optimistic concurrency.
///
/// Readers get a [`Versioned`] snapshot; writers commit only if the version they
/// read is still current. Every method is a single round-trip to the backend and
/// either fully applies or has no effect.
pub trait VersionedStore<V>: Send + Sync {
    /// Create `key` at version 1. Fails with [`StoreError::AlreadyExists`] if taken.
    fn insert(&self, key: &str, value: V) -> impl Future<Output = StoreResult<()>> + Send;

    /// Read the latest committed value.
    fn get(&self, key: &str) -> impl Future<Output = StoreResult<Option<Versioned<V>>>> + Send;

    /// Replace the value only if it is still at `expected_version`.
    fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: V,
    ) -> impl Future<Output = StoreResult<CasOutcome>> + Send;

    /// Number of keys held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backend tuning knobs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Artificial delay per round-trip in microseconds. Zero disables it.
    pub latency_us: u64,
}

/// Counters kept by [`crate::MemoryStore`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Keys created.
    pub inserts: u64,
    /// `get` calls, hits and misses alike.
    pub reads: u64,
    /// Compare-and-swap calls that applied their write.
    pub commits: u64,
    /// Compare-and-swap calls rejected because the version had moved on.
    pub conflicts: u64,
}
