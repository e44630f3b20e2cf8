use std::fmt;

use chrono::{DateTime, Utc};
use hongbao_partition::{Amount, PartitionError};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque packet identifier: 16 random bytes, hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(String);

impl PacketId {
    /// Draw a fresh random identifier.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PacketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a creator or claimant, as resolved by the surrounding application.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who is claiming, plus the display details copied onto their claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claimant {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Claimant {
    /// A claimant whose display name is their id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = UserId::new(id);
        Self {
            display_name: id.as_str().to_string(),
            id,
            avatar_url: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_avatar_url(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// One claimant's share of a packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Who holds this share.
    pub claimant: UserId,
    /// Claimant's display name at the time of the grant.
    pub display_name: String,
    /// Claimant's avatar at the time of the grant, if they had one.
    pub avatar_url: Option<String>,
    /// Value of the share.
    pub amount: Amount,
    /// When the grant was committed, per the service clock.
    pub claimed_at: DateTime<Utc>,
    /// True when `amount` equals the largest claimed amount (ties all qualify).
    pub is_best_share: bool,
}

/// Whether a packet still has shares to hand out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketState {
    Open,
    Exhausted,
}

/// The persisted form of a packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Key the record is stored under.
    pub id: PacketId,
    /// User who funded the packet.
    pub creator: UserId,
    /// Total of all shares, claimed or not.
    pub fund: Amount,
    /// Number of shares the fund was split into. Fixed at creation.
    pub share_count: u32,
    /// Greeting shown with the packet.
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Shares not yet handed out. Grants pop from the tail.
    pub unclaimed_shares: Vec<Amount>,
    /// Claims in the order they were granted. Claimant ids are unique.
    pub claims: Vec<Claim>,
}

/// Read-only view of a packet returned by `status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSnapshot {
    pub id: PacketId,
    pub creator: UserId,
    pub fund: Amount,
    pub share_count: u32,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// `Exhausted` once no shares are left.
    pub state: PacketState,
    /// Shares not yet handed out.
    pub shares_left: u32,
    /// Sum of the granted shares.
    pub claimed_total: Amount,
    /// Sum of the shares not yet handed out.
    pub remaining_total: Amount,
    pub claims: Vec<Claim>,
}

impl PacketSnapshot {
    pub fn is_finished(&self) -> bool {
        self.state == PacketState::Exhausted
    }

    /// Claims currently flagged as best share.
    pub fn best_shares(&self) -> impl Iterator<Item = &Claim> {
        self.claims.iter().filter(|c| c.is_best_share)
    }
}

/// Result of a claim attempt. None of these are errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "claim", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimOutcome {
    /// A share was removed from the pool and recorded for this claimant.
    Granted(Claim),
    /// This claimant already holds a share; it is returned unchanged.
    AlreadyClaimed(Claim),
    /// No shares were left when the attempt was decided.
    Exhausted,
}

impl ClaimOutcome {
    pub fn claim(&self) -> Option<&Claim> {
        match self {
            ClaimOutcome::Granted(c) | ClaimOutcome::AlreadyClaimed(c) => Some(c),
            ClaimOutcome::Exhausted => None,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted(_))
    }
}

/// A packet record that breaks its own accounting.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("stored under {key} but record id is {found}")]
    IdMismatch { key: PacketId, found: PacketId },

    #[error("shares total {found_cents} cents, fund is {fund}")]
    FundMismatch { fund: Amount, found_cents: u128 },

    #[error("{found} shares accounted for, packet has {share_count}")]
    ShareCountMismatch { share_count: u32, found: usize },

    #[error("share of {0} is below the minimum")]
    NonPositiveShare(Amount),

    #[error("claimant {0} holds more than one claim")]
    DuplicateClaimant(UserId),

    #[error("packet was halted after an earlier violation")]
    Quarantined,
}

/// Errors that can occur in the allocator.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("invalid packet configuration: {0}")]
    InvalidConfiguration(String),

    #[error("packet not found: {0}")]
    NotFound(PacketId),

    /// Retryable. The outcome of the attempt is unknown; re-query `status`.
    #[error("store failure after {attempts} attempt(s): {reason}")]
    TransientStoreFailure { attempts: u32, reason: String },

    #[error("packet {packet} is corrupted: {violation}")]
    Corrupted {
        packet: PacketId,
        violation: InvariantViolation,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<PartitionError> for AllocatorError {
    fn from(e: PartitionError) -> Self {
        AllocatorError::InvalidConfiguration(e.to_string())
    }
}

impl AllocatorError {
    /// Whether the caller may retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocatorError::TransientStoreFailure { .. })
    }
}
