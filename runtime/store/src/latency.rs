use std::time::Duration;

use crate::types::*;

/// Wraps a store and delays every round-trip, so that concurrent readers and
/// writers interleave the way they would against a remote backend.
pub struct LatencyStore<S> {
    inner: S,
    latency: Duration,
}

impl<S> LatencyStore<S> {
    pub fn new(inner: S, latency: Duration) -> Self {
        Self { inner, latency }
    }

    /// Build from a [`StoreConfig`].
    pub fn from_config(inner: S, config: &StoreConfig) -> Self {
        Self::new(inner, Duration::from_micros(config.latency_us))
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl<S, V> VersionedStore<V> for LatencyStore<S>
where
    S: VersionedStore<V>,
    V: Send + Sync,
{
    async fn insert(&self, key: &str, value: V) -> StoreResult<()> {
        self.round_trip().await;
        self.inner.insert(key, value).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Versioned<V>>> {
        self.round_trip().await;
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: V,
    ) -> StoreResult<CasOutcome> {
        self.round_trip().await;
        let outcome = self.inner.compare_and_swap(key, expected_version, value).await?;
        tracing::trace!(key, ?outcome, "delayed compare-and-swap");
        Ok(outcome)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
