use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hongbao_partition::{generate, Amount, MIN_SHARE};
use hongbao_store::{CasOutcome, StoreError, Versioned, VersionedStore};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AllocatorConfig;
use crate::types::*;

/// How much of a loaded record to verify.
#[derive(Clone, Copy)]
enum Check {
    /// Every invariant. O(claims), with a hash set for claimant uniqueness.
    Full,
    /// Share accounting only. O(1).
    Shape,
}

/// Creates packets and hands out their shares to concurrent claimants.
///
/// All packet mutation goes through [`PacketService::claim`], which runs an
/// optimistic read-decide-write loop against the store: it reads the latest
/// version, decides the outcome in memory, and commits with a compare-and-swap
/// on that version. A lost race re-reads and decides again, so every outcome is
/// decided against the state it is committed on top of.
pub struct PacketService<S> {
    store: S,
    config: AllocatorConfig,
    rng: Mutex<StdRng>,
    clock: Arc<dyn Clock>,
    /// Packets that failed an invariant check. Every later call on them fails.
    quarantined: RwLock<HashSet<PacketId>>,
}

impl<S> PacketService<S>
where
    S: VersionedStore<PacketRecord>,
{
    /// Create a service with an entropy-seeded RNG and the system clock.
    pub fn new(store: S, config: AllocatorConfig) -> Self {
        Self {
            store,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            clock: Arc::new(SystemClock),
            quarantined: RwLock::new(HashSet::new()),
        }
    }

    /// Use a deterministic RNG for partitions, packet ids and backoff jitter.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Split `fund` into `share_count` random shares and persist a new open packet.
    pub async fn create_packet(
        &self,
        fund: Amount,
        share_count: u32,
        message: impl Into<String>,
        creator: UserId,
    ) -> Result<PacketId, AllocatorError> {
        self.config.check_share_count(share_count as usize)?;
        let shares = {
            let mut rng = self.rng.lock();
            generate(fund, share_count, &mut *rng)?
        };
        self.persist(creator, message.into(), fund, shares).await
    }

    /// Persist a packet with caller-chosen shares. Grants take them from the end
    /// of `shares`.
    pub async fn create_packet_with_shares(
        &self,
        shares: Vec<Amount>,
        message: impl Into<String>,
        creator: UserId,
    ) -> Result<PacketId, AllocatorError> {
        if shares.is_empty() {
            return Err(AllocatorError::InvalidConfiguration(
                "a packet needs at least one share".into(),
            ));
        }
        self.config.check_share_count(shares.len())?;
        if let Some(bad) = shares.iter().find(|s| **s < MIN_SHARE) {
            return Err(AllocatorError::InvalidConfiguration(format!(
                "share of {bad} is below the 0.01 minimum"
            )));
        }
        let fund = shares
            .iter()
            .try_fold(Amount::ZERO, |acc, s| acc.checked_add(*s))
            .ok_or_else(|| AllocatorError::InvalidConfiguration("fund overflows".into()))?;
        self.persist(creator, message.into(), fund, shares).await
    }

    async fn persist(
        &self,
        creator: UserId,
        message: String,
        fund: Amount,
        shares: Vec<Amount>,
    ) -> Result<PacketId, AllocatorError> {
        let share_count = shares.len();
        let created_at = self.clock.now();

        for attempt in 1..=self.config.max_attempts {
            let id = self.next_packet_id();
            let record = PacketRecord::new(
                id.clone(),
                creator.clone(),
                fund,
                message.clone(),
                shares.clone(),
                created_at,
            );
            match self.store.insert(id.as_str(), record).await {
                Ok(()) => {
                    info!(packet = %id, %creator, %fund, share_count, "packet created");
                    return Ok(id);
                }
                Err(StoreError::AlreadyExists(_)) => {
                    warn!(packet = %id, attempt, "packet id collision, drawing a new id");
                }
                Err(e) => return Err(self.store_failure(&id, attempt, e)),
            }
        }

        Err(AllocatorError::TransientStoreFailure {
            attempts: self.config.max_attempts,
            reason: "could not allocate a unique packet id".into(),
        })
    }

    /// Try to hand one share of `packet` to `claimant`.
    ///
    /// Repeated calls by a claimant who already holds a share return that share
    /// and change nothing. Conflicting writers are retried internally; the caller
    /// only sees [`AllocatorError::TransientStoreFailure`] once the store fails or
    /// the attempt budget runs out.
    pub async fn claim(
        &self,
        packet: &PacketId,
        claimant: &Claimant,
    ) -> Result<ClaimOutcome, AllocatorError> {
        self.ensure_not_quarantined(packet)?;

        let mut budget = self.config.max_attempts;
        let mut attempt = 0;
        while attempt < budget {
            attempt += 1;
            // Retried reads only get the cheap check; the record was verified
            // by whichever claim committed it.
            let check = if attempt == 1 { Check::Full } else { Check::Shape };
            let Versioned { version, value } = self.load(packet, attempt, check).await?;

            // Every lost race is another claim's committed grant, so a claim can
            // lose at most `share_count` of them before it is decided.
            budget = budget.max(value.share_count.saturating_add(1));

            if let Some(existing) = value.claim_of(&claimant.id) {
                debug!(%packet, claimant = %claimant.id, amount = %existing.amount, "already claimed");
                return Ok(ClaimOutcome::AlreadyClaimed(existing.clone()));
            }

            let mut next = value;
            let Some(granted) = next.grant(claimant, self.clock.now()) else {
                debug!(%packet, claimant = %claimant.id, "packet exhausted");
                return Ok(ClaimOutcome::Exhausted);
            };
            next.check_grant(&granted)
                .map_err(|violation| self.quarantine(packet, violation))?;
            let shares_left = next.unclaimed_shares.len();

            let outcome = self
                .store
                .compare_and_swap(packet.as_str(), version, next)
                .await
                .map_err(|e| self.store_failure(packet, attempt, e))?;

            match outcome {
                CasOutcome::Committed { version } => {
                    debug!(
                        %packet,
                        claimant = %claimant.id,
                        amount = %granted.amount,
                        version,
                        shares_left,
                        "share granted"
                    );
                    if shares_left == 0 {
                        info!(%packet, "last share granted, packet exhausted");
                    }
                    return Ok(ClaimOutcome::Granted(granted));
                }
                CasOutcome::Conflict { current_version } => {
                    debug!(
                        %packet,
                        claimant = %claimant.id,
                        attempt,
                        read_version = version,
                        current_version,
                        "claim lost a write race, retrying"
                    );
                    self.back_off(attempt).await;
                }
            }
        }

        warn!(
            %packet,
            claimant = %claimant.id,
            attempts = attempt,
            "claim gave up under write contention"
        );
        Err(AllocatorError::TransientStoreFailure {
            attempts: attempt,
            reason: "write contention exceeded the retry budget".into(),
        })
    }

    /// Current state of `packet`. Never writes.
    pub async fn status(&self, packet: &PacketId) -> Result<PacketSnapshot, AllocatorError> {
        self.ensure_not_quarantined(packet)?;
        let current = self.load(packet, 1, Check::Full).await?;
        Ok(current.value.snapshot())
    }

    /// Whether `packet` has been halted after an invariant violation.
    pub fn is_quarantined(&self, packet: &PacketId) -> bool {
        self.quarantined.read().contains(packet)
    }

    async fn load(
        &self,
        packet: &PacketId,
        attempt: u32,
        check: Check,
    ) -> Result<Versioned<PacketRecord>, AllocatorError> {
        let current = self
            .store
            .get(packet.as_str())
            .await
            .map_err(|e| self.store_failure(packet, attempt, e))?
            .ok_or_else(|| AllocatorError::NotFound(packet.clone()))?;
        if current.value.id != *packet {
            return Err(self.quarantine(
                packet,
                InvariantViolation::IdMismatch {
                    key: packet.clone(),
                    found: current.value.id.clone(),
                },
            ));
        }
        let checked = match check {
            Check::Full => current.value.check_invariants(),
            Check::Shape => current.value.check_shape(),
        };
        checked.map_err(|violation| self.quarantine(packet, violation))?;
        Ok(current)
    }

    fn quarantine(&self, packet: &PacketId, violation: InvariantViolation) -> AllocatorError {
        error!(%packet, %violation, "packet invariant violated, halting packet");
        self.quarantined.write().insert(packet.clone());
        AllocatorError::Corrupted {
            packet: packet.clone(),
            violation,
        }
    }

    fn ensure_not_quarantined(&self, packet: &PacketId) -> Result<(), AllocatorError> {
        if self.is_quarantined(packet) {
            return Err(AllocatorError::Corrupted {
                packet: packet.clone(),
                violation: InvariantViolation::Quarantined,
            });
        }
        Ok(())
    }

    fn store_failure(&self, packet: &PacketId, attempt: u32, e: StoreError) -> AllocatorError {
        match e {
            StoreError::NotFound(_) => AllocatorError::NotFound(packet.clone()),
            e => {
                warn!(%packet, attempt, error = %e, "store round-trip failed");
                AllocatorError::TransientStoreFailure {
                    attempts: attempt,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn next_packet_id(&self) -> PacketId {
        PacketId::random(&mut *self.rng.lock())
    }

    fn backoff_delay(&self, attempt: u32) -> Option<Duration> {
        let ceiling = self.config.backoff_ceiling(attempt)?;
        let us = self.rng.lock().gen_range(0..=ceiling.as_micros() as u64);
        Some(Duration::from_micros(us))
    }

    async fn back_off(&self, attempt: u32) {
        match self.backoff_delay(attempt) {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }
}
