use std::collections::HashMap;
use std::future::{ready, Future};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::*;

/// In-process [`VersionedStore`].
///
/// The key map is behind a read-write lock that is only held for lookups and
/// inserts; each entry has its own mutex, so writes to different keys never
/// wait on each other.
pub struct MemoryStore<V> {
    entries: RwLock<HashMap<String, Arc<Mutex<Versioned<V>>>>>,
    stats: Mutex<StoreStats>,
}

impl<V: Clone> MemoryStore<V> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: Mutex::new(StoreStats::default()),
        }
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    fn entry(&self, key: &str) -> Option<Arc<Mutex<Versioned<V>>>> {
        self.entries.read().get(key).cloned()
    }

    fn insert_now(&self, key: &str, value: V) -> StoreResult<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        entries.insert(key.to_string(), Arc::new(Mutex::new(Versioned::new(1, value))));
        drop(entries);

        self.stats.lock().inserts += 1;
        Ok(())
    }

    fn get_now(&self, key: &str) -> StoreResult<Option<Versioned<V>>> {
        self.stats.lock().reads += 1;
        Ok(self.entry(key).map(|slot| slot.lock().clone()))
    }

    fn compare_and_swap_now(
        &self,
        key: &str,
        expected_version: u64,
        value: V,
    ) -> StoreResult<CasOutcome> {
        let slot = self
            .entry(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let outcome = {
            let mut current = slot.lock();
            if current.version == expected_version {
                current.version += 1;
                current.value = value;
                CasOutcome::Committed {
                    version: current.version,
                }
            } else {
                CasOutcome::Conflict {
                    current_version: current.version,
                }
            }
        };

        let mut stats = self.stats.lock();
        match outcome {
            CasOutcome::Committed { .. } => stats.commits += 1,
            CasOutcome::Conflict { .. } => stats.conflicts += 1,
        }
        Ok(outcome)
    }
}

impl<V: Clone> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> VersionedStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync,
{
    fn insert(&self, key: &str, value: V) -> impl Future<Output = StoreResult<()>> + Send {
        ready(self.insert_now(key, value))
    }

    fn get(&self, key: &str) -> impl Future<Output = StoreResult<Option<Versioned<V>>>> + Send {
        ready(self.get_now(key))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: V,
    ) -> impl Future<Output = StoreResult<CasOutcome>> + Send {
        ready(self.compare_and_swap_now(key, expected_version, value))
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
