use std::collections::HashSet;

use chrono::{DateTime, Utc};
use hongbao_partition::{Amount, MIN_SHARE};

use crate::types::*;

/// Flag every claim whose amount equals the maximum claimed amount.
///
/// Ties all win. A zero maximum flags nothing. Runs in O(claims), which is fine
/// while share counts stay in the thousands.
pub fn mark_best_shares(claims: &mut [Claim]) {
    let best = claims.iter().map(|c| c.amount).max().unwrap_or(Amount::ZERO);
    for claim in claims.iter_mut() {
        claim.is_best_share = !best.is_zero() && claim.amount == best;
    }
}

impl PacketRecord {
    /// A fresh, unclaimed packet holding `shares`.
    pub fn new(
        id: PacketId,
        creator: UserId,
        fund: Amount,
        message: String,
        shares: Vec<Amount>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            creator,
            fund,
            share_count: shares.len() as u32,
            message,
            created_at,
            unclaimed_shares: shares,
            claims: Vec::new(),
        }
    }

    pub fn state(&self) -> PacketState {
        if self.unclaimed_shares.is_empty() {
            PacketState::Exhausted
        } else {
            PacketState::Open
        }
    }

    /// The existing claim held by `user`, if any.
    pub fn claim_of(&self, user: &UserId) -> Option<&Claim> {
        self.claims.iter().find(|c| &c.claimant == user)
    }

    pub fn claimed_total(&self) -> Amount {
        self.claims.iter().map(|c| c.amount).sum()
    }

    /// Move one share from the pool to `claimant`.
    ///
    /// Returns `None` when the pool is empty. The caller must already have checked
    /// that `claimant` holds no claim.
    pub fn grant(&mut self, claimant: &Claimant, at: DateTime<Utc>) -> Option<Claim> {
        let amount = self.unclaimed_shares.pop()?;
        self.claims.push(Claim {
            claimant: claimant.id.clone(),
            display_name: claimant.display_name.clone(),
            avatar_url: claimant.avatar_url.clone(),
            amount,
            claimed_at: at,
            is_best_share: false,
        });
        mark_best_shares(&mut self.claims);
        self.claims.last().cloned()
    }

    /// Verify the accounting invariants: pool plus claims conserve the fund and the
    /// share count, every amount is at least one cent, and no claimant appears twice.
    ///
    /// O(claims) plus a hash set of claimant ids.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.check_shape()?;

        let amounts = self
            .unclaimed_shares
            .iter()
            .copied()
            .chain(self.claims.iter().map(|c| c.amount));
        let mut total: u128 = 0;
        for amount in amounts {
            if amount < MIN_SHARE {
                return Err(InvariantViolation::NonPositiveShare(amount));
            }
            total += amount.cents() as u128;
        }
        if total != self.fund.cents() as u128 {
            return Err(InvariantViolation::FundMismatch {
                fund: self.fund,
                found_cents: total,
            });
        }

        let mut seen = HashSet::with_capacity(self.claims.len());
        for claim in &self.claims {
            if !seen.insert(&claim.claimant) {
                return Err(InvariantViolation::DuplicateClaimant(claim.claimant.clone()));
            }
        }

        Ok(())
    }

    /// Every share is either unclaimed or claimed, never both or neither.
    pub fn check_shape(&self) -> Result<(), InvariantViolation> {
        let accounted = self.unclaimed_shares.len() + self.claims.len();
        if accounted != self.share_count as usize {
            return Err(InvariantViolation::ShareCountMismatch {
                share_count: self.share_count,
                found: accounted,
            });
        }
        Ok(())
    }

    /// Check a record that was fully verified before `granted` moved a share out
    /// of the pool. Only the moved share and the accounting can have changed.
    pub fn check_grant(&self, granted: &Claim) -> Result<(), InvariantViolation> {
        self.check_shape()?;
        if granted.amount < MIN_SHARE {
            return Err(InvariantViolation::NonPositiveShare(granted.amount));
        }
        let held = self
            .claims
            .iter()
            .filter(|c| c.claimant == granted.claimant)
            .count();
        if held != 1 {
            return Err(InvariantViolation::DuplicateClaimant(granted.claimant.clone()));
        }
        Ok(())
    }

    /// Read view with best-share flags recomputed.
    pub fn snapshot(&self) -> PacketSnapshot {
        let mut claims = self.claims.clone();
        mark_best_shares(&mut claims);
        PacketSnapshot {
            id: self.id.clone(),
            creator: self.creator.clone(),
            fund: self.fund,
            share_count: self.share_count,
            message: self.message.clone(),
            created_at: self.created_at,
            state: self.state(),
            shares_left: self.unclaimed_shares.len() as u32,
            claimed_total: self.claimed_total(),
            remaining_total: self.unclaimed_shares.iter().sum(),
            claims,
        }
    }
}
