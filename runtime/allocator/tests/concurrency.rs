//! Concurrency tests for the claim allocator.
//!
//! These race many claimants against one packet on a multi-threaded runtime,
//! with and without simulated store latency, and check that grants stay
//! at-most-once per claimant, at-most-N per packet, and lose no shares.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hongbao_allocator::*;
use hongbao_partition::Amount;
use hongbao_store::{
    CasOutcome, LatencyStore, MemoryStore, StoreError, StoreResult, Versioned, VersionedStore,
};

type MemService = PacketService<MemoryStore<PacketRecord>>;
type SlowService = PacketService<LatencyStore<MemoryStore<PacketRecord>>>;

fn mem_service(seed: u64) -> Arc<MemService> {
    Arc::new(PacketService::new(MemoryStore::new(), AllocatorConfig::default()).with_seed(seed))
}

fn slow_service(seed: u64, latency: Duration) -> Arc<SlowService> {
    let config = AllocatorConfig {
        max_attempts: 10_000,
        ..AllocatorConfig::default()
    };
    let store = LatencyStore::new(MemoryStore::new(), latency);
    Arc::new(PacketService::new(store, config).with_seed(seed))
}

/// Spawn one task per claimant and collect `(claimant, outcome)` pairs.
async fn race<S>(
    svc: &Arc<PacketService<S>>,
    packet: &PacketId,
    claimants: Vec<String>,
) -> Vec<(String, ClaimOutcome)>
where
    S: VersionedStore<PacketRecord> + 'static,
{
    let handles: Vec<_> = claimants
        .into_iter()
        .map(|name| {
            let svc = svc.clone();
            let packet = packet.clone();
            tokio::spawn(async move {
                let outcome = svc
                    .claim(&packet, &Claimant::new(name.clone()))
                    .await
                    .expect("claim should not fail");
                (name, outcome)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for h in handles {
        results.push(h.await.expect("claim task panicked"));
    }
    results
}

fn sorted(mut v: Vec<Amount>) -> Vec<Amount> {
    v.sort();
    v
}

fn assert_conserved(snap: &PacketSnapshot, partition: &[Amount]) {
    let claimed: Vec<Amount> = snap.claims.iter().map(|c| c.amount).collect();
    assert_eq!(snap.claims.len() + snap.shares_left as usize, snap.share_count as usize);
    assert_eq!(
        snap.claimed_total.checked_add(snap.remaining_total),
        Some(snap.fund)
    );
    if snap.is_finished() {
        assert_eq!(sorted(claimed), sorted(partition.to_vec()));
        assert_eq!(snap.claimed_total, snap.fund);
    }
    let unique: HashSet<_> = snap.claims.iter().map(|c| c.claimant.clone()).collect();
    assert_eq!(unique.len(), snap.claims.len());
}

async fn partition_of<S: VersionedStore<PacketRecord>>(
    svc: &PacketService<S>,
    packet: &PacketId,
) -> Vec<Amount> {
    svc.store()
        .get(packet.as_str())
        .await
        .unwrap()
        .unwrap()
        .value
        .unclaimed_shares
}

// ---------------------------------------------------------------------------
// Basic races
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn three_shares_three_claimants_then_exhausted() {
    let svc = mem_service(1);
    let packet = svc
        .create_packet(Amount::from_cents(1000), 3, "race", UserId::from("boss"))
        .await
        .unwrap();
    let partition = partition_of(&svc, &packet).await;

    let results = race(&svc, &packet, vec!["a".into(), "b".into(), "c".into()]).await;
    let granted: Vec<Amount> = results
        .iter()
        .filter_map(|(_, o)| match o {
            ClaimOutcome::Granted(c) => Some(c.amount),
            _ => None,
        })
        .collect();
    assert_eq!(granted.len(), 3);
    assert_eq!(sorted(granted), sorted(partition.clone()));

    let late = svc.claim(&packet, &Claimant::new("d")).await.unwrap();
    assert_eq!(late, ClaimOutcome::Exhausted);

    let snap = svc.status(&packet).await.unwrap();
    assert!(snap.is_finished());
    assert_conserved(&snap, &partition);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn four_concurrent_claimants_on_three_shares() {
    let svc = slow_service(2, Duration::from_millis(1));
    let packet = svc
        .create_packet(Amount::from_cents(1000), 3, "race", UserId::from("boss"))
        .await
        .unwrap();

    let results = race(
        &svc,
        &packet,
        vec!["a".into(), "b".into(), "c".into(), "d".into()],
    )
    .await;
    let granted = results.iter().filter(|(_, o)| o.is_granted()).count();
    let exhausted = results
        .iter()
        .filter(|(_, o)| *o == ClaimOutcome::Exhausted)
        .count();
    assert_eq!(granted, 3);
    assert_eq!(exhausted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn same_claimant_twice_concurrently_gets_one_share() {
    let svc = slow_service(3, Duration::from_millis(1));
    let packet = svc
        .create_packet(Amount::from_cents(5000), 5, "", UserId::from("boss"))
        .await
        .unwrap();

    let results = race(&svc, &packet, vec!["dup".into(), "dup".into()]).await;
    let granted: Vec<_> = results
        .iter()
        .filter_map(|(_, o)| match o {
            ClaimOutcome::Granted(c) => Some(c.clone()),
            _ => None,
        })
        .collect();
    let already: Vec<_> = results
        .iter()
        .filter_map(|(_, o)| match o {
            ClaimOutcome::AlreadyClaimed(c) => Some(c.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(granted.len(), 1);
    assert_eq!(already.len(), 1);
    assert_eq!(granted[0].amount, already[0].amount);
    assert_eq!(granted[0].claimed_at, already[0].claimed_at);

    let snap = svc.status(&packet).await.unwrap();
    assert_eq!(snap.claims.len(), 1);
    assert_eq!(snap.shares_left, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn same_claimant_many_times_changes_state_once() {
    let svc = mem_service(4);
    let packet = svc
        .create_packet(Amount::from_cents(300), 3, "", UserId::from("boss"))
        .await
        .unwrap();

    let results = race(&svc, &packet, vec!["spam".to_string(); 32]).await;
    let amounts: HashSet<Amount> = results
        .iter()
        .map(|(_, o)| o.claim().expect("every call sees the claim").amount)
        .collect();
    assert_eq!(amounts.len(), 1);
    assert_eq!(results.iter().filter(|(_, o)| o.is_granted()).count(), 1);
    assert_eq!(svc.status(&packet).await.unwrap().claims.len(), 1);
}

// ---------------------------------------------------------------------------
// Stress
// ---------------------------------------------------------------------------

async fn stress<S>(svc: Arc<PacketService<S>>, share_count: u32, extra: usize)
where
    S: VersionedStore<PacketRecord> + 'static,
{
    let packet = svc
        .create_packet(Amount::from_cents(88_888), share_count, "stress", UserId::from("boss"))
        .await
        .unwrap();
    let partition = partition_of(&svc, &packet).await;

    let names: Vec<String> = (0..share_count as usize + extra)
        .map(|i| format!("user-{i}"))
        .collect();
    let results = race(&svc, &packet, names).await;

    let granted: HashMap<&str, Amount> = results
        .iter()
        .filter_map(|(n, o)| match o {
            ClaimOutcome::Granted(c) => Some((n.as_str(), c.amount)),
            _ => None,
        })
        .collect();
    let exhausted = results
        .iter()
        .filter(|(_, o)| *o == ClaimOutcome::Exhausted)
        .count();

    assert_eq!(granted.len(), share_count as usize);
    assert_eq!(exhausted, extra);
    assert_eq!(
        sorted(granted.values().copied().collect()),
        sorted(partition.clone())
    );

    let snap = svc.status(&packet).await.unwrap();
    assert!(snap.is_finished());
    assert_conserved(&snap, &partition);
    for claim in &snap.claims {
        assert_eq!(granted.get(claim.claimant.as_str()), Some(&claim.amount));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_in_memory() {
    stress(mem_service(5), 50, 150).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_with_store_latency() {
    stress(slow_service(6, Duration::from_micros(200)), 20, 30).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_with_backoff() {
    let config = AllocatorConfig {
        max_attempts: 10_000,
        backoff_base_us: 50,
        backoff_max_us: 1_000,
        ..AllocatorConfig::default()
    };
    let store = LatencyStore::new(MemoryStore::new(), Duration::from_micros(100));
    let svc = Arc::new(PacketService::new(store, config).with_seed(7));
    stress(svc, 16, 16).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_with_default_config_beyond_attempt_floor() {
    let store = LatencyStore::new(MemoryStore::new(), Duration::from_micros(20));
    let svc = Arc::new(PacketService::new(store, AllocatorConfig::default()).with_seed(12));
    assert!(svc.config().max_attempts < 200);
    stress(svc, 200, 100).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn packets_are_independent() {
    let svc = mem_service(8);
    let mut packets = Vec::new();
    for i in 0..4u32 {
        let packet = svc
            .create_packet(Amount::from_cents(1000), 2 + i, "", UserId::from("boss"))
            .await
            .unwrap();
        packets.push(packet);
    }

    let mut handles = Vec::new();
    for packet in &packets {
        let svc = svc.clone();
        let packet = packet.clone();
        handles.push(tokio::spawn(async move {
            let names = (0..10).map(|i| format!("u{i}")).collect();
            race(&svc, &packet, names).await
        }));
    }
    for (i, h) in handles.into_iter().enumerate() {
        let results = h.await.unwrap();
        let granted = results.iter().filter(|(_, o)| o.is_granted()).count();
        assert_eq!(granted, 2 + i);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_packet_never_reopens() {
    let svc = mem_service(9);
    let packet = svc
        .create_packet(Amount::from_cents(100), 2, "", UserId::from("boss"))
        .await
        .unwrap();
    race(&svc, &packet, vec!["a".into(), "b".into()]).await;

    let late: Vec<String> = (0..20).map(|i| format!("late-{i}")).collect();
    let results = race(&svc, &packet, late).await;
    assert!(results.iter().all(|(_, o)| *o == ClaimOutcome::Exhausted));
    assert_eq!(svc.status(&packet).await.unwrap().claims.len(), 2);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn abandoned_claims_leave_no_partial_state() {
    let svc = slow_service(10, Duration::from_millis(2));
    let packet = svc
        .create_packet(Amount::from_cents(2000), 10, "", UserId::from("boss"))
        .await
        .unwrap();
    let partition = partition_of(&svc, &packet).await;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let svc = svc.clone();
            let packet = packet.clone();
            tokio::spawn(async move {
                let who = Claimant::new(format!("impatient-{i}"));
                // Some calls are dropped mid-flight, before or after their write.
                let _ = tokio::time::timeout(
                    Duration::from_micros(500 * (i % 8) as u64),
                    svc.claim(&packet, &who),
                )
                .await;
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    let snap = svc.status(&packet).await.unwrap();
    assert_conserved(&snap, &partition);

    // Anyone whose call was abandoned can simply try again.
    for i in 0..20 {
        let who = Claimant::new(format!("impatient-{i}"));
        let outcome = svc.claim(&packet, &who).await.unwrap();
        let had_claim = snap.claims.iter().any(|c| c.claimant == who.id);
        if had_claim {
            assert!(matches!(outcome, ClaimOutcome::AlreadyClaimed(_)));
        }
    }
    let snap = svc.status(&packet).await.unwrap();
    assert!(snap.is_finished());
    assert_conserved(&snap, &partition);
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

/// Memory store that can be switched off, and can refuse writes.
struct FaultyStore {
    inner: MemoryStore<PacketRecord>,
    down: AtomicBool,
    always_conflict: AtomicBool,
    /// Writes still to be refused before writes go through again.
    conflicts_left: AtomicU32,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            down: AtomicBool::new(false),
            always_conflict: AtomicBool::new(false),
            conflicts_left: AtomicU32::new(0),
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl VersionedStore<PacketRecord> for FaultyStore {
    async fn insert(&self, key: &str, value: PacketRecord) -> StoreResult<()> {
        self.check()?;
        self.inner.insert(key, value).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Versioned<PacketRecord>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: PacketRecord,
    ) -> StoreResult<CasOutcome> {
        self.check()?;
        let refused = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused || self.always_conflict.load(Ordering::SeqCst) {
            return Ok(CasOutcome::Conflict {
                current_version: expected_version + 1,
            });
        }
        self.inner.compare_and_swap(key, expected_version, value).await
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[tokio::test]
async fn unreachable_store_is_transient_failure() {
    let svc = PacketService::new(FaultyStore::new(), AllocatorConfig::default());
    let packet = svc
        .create_packet(Amount::from_cents(500), 2, "", UserId::from("boss"))
        .await
        .unwrap();

    svc.store().down.store(true, Ordering::SeqCst);
    let err = svc.claim(&packet, &Claimant::new("a")).await.unwrap_err();
    assert!(err.is_retryable(), "got {err:?}");
    assert!(svc.status(&packet).await.unwrap_err().is_retryable());
    assert!(svc
        .create_packet(Amount::from_cents(500), 2, "", UserId::from("boss"))
        .await
        .unwrap_err()
        .is_retryable());

    // Once the store is back, the claimant can retry and nothing was half-applied.
    svc.store().down.store(false, Ordering::SeqCst);
    let snap = svc.status(&packet).await.unwrap();
    assert!(snap.claims.is_empty());
    assert!(svc.claim(&packet, &Claimant::new("a")).await.unwrap().is_granted());
}

#[tokio::test]
async fn endless_conflicts_exhaust_retry_budget() {
    let config = AllocatorConfig {
        max_attempts: 5,
        ..AllocatorConfig::default()
    };
    let svc = PacketService::new(FaultyStore::new(), config);
    let packet = svc
        .create_packet(Amount::from_cents(500), 2, "", UserId::from("boss"))
        .await
        .unwrap();

    svc.store().always_conflict.store(true, Ordering::SeqCst);
    let err = svc.claim(&packet, &Claimant::new("a")).await.unwrap_err();
    assert_eq!(
        err,
        AllocatorError::TransientStoreFailure {
            attempts: 5,
            reason: "write contention exceeded the retry budget".into(),
        }
    );

    svc.store().always_conflict.store(false, Ordering::SeqCst);
    assert_eq!(svc.status(&packet).await.unwrap().shares_left, 2);
}

#[tokio::test]
async fn lost_races_up_to_share_count_are_retried() {
    let config = AllocatorConfig {
        max_attempts: 2,
        ..AllocatorConfig::default()
    };
    let svc = PacketService::new(FaultyStore::new(), config);
    let packet = svc
        .create_packet(Amount::from_cents(1000), 10, "", UserId::from("boss"))
        .await
        .unwrap();

    // Ten lost races on a ten-share packet still end in a grant.
    svc.store().conflicts_left.store(10, Ordering::SeqCst);
    let outcome = svc.claim(&packet, &Claimant::new("a")).await.unwrap();
    assert!(outcome.is_granted());
    assert_eq!(svc.store().conflicts_left.load(Ordering::SeqCst), 0);
    assert_eq!(svc.store().inner.stats().commits, 1);
}

#[tokio::test]
async fn status_never_writes() {
    let svc = mem_service(11);
    let packet = svc
        .create_packet(Amount::from_cents(500), 2, "", UserId::from("boss"))
        .await
        .unwrap();
    for _ in 0..10 {
        svc.status(&packet).await.unwrap();
    }
    let stats = svc.store().stats();
    assert_eq!(stats.commits, 0);
    assert_eq!(stats.conflicts, 0);
}
