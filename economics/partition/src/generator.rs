use rand::seq::SliceRandom;
use rand::Rng;
use tracing::trace;

use crate::amount::{Amount, MIN_SHARE};
use crate::types::PartitionError;

/// Split `fund` into `share_count` positive amounts that sum exactly to `fund`.
///
/// Each draw except the last is uniform over `[0, 2 * remaining / shares_left)`,
/// truncated to whole cents and floored at [`MIN_SHARE`]. The last share takes
/// whatever is left, and the result is shuffled so position says nothing about size.
///
/// The draw is done in units of `1 / shares_left` cent: picking `x` uniformly
/// from `[0, 2 * remaining)` and dividing by `shares_left` is the exact integer
/// form of "uniform real below the cap, rounded toward zero". With
/// `remaining >= shares_left` on entry, every draw leaves at least one cent per
/// remaining share, so the last share is never below the minimum.
pub fn generate<R: Rng + ?Sized>(
    fund: Amount,
    share_count: u32,
    rng: &mut R,
) -> Result<Vec<Amount>, PartitionError> {
    let floor = MIN_SHARE.checked_mul(share_count as u64);
    if share_count == 0 || floor.map_or(true, |floor| fund < floor) {
        return Err(PartitionError::InvalidConfiguration { fund, share_count });
    }

    let mut shares = Vec::with_capacity(share_count as usize);
    let mut remaining = fund.cents();
    let mut shares_left = share_count as u64;

    while shares_left > 1 {
        let span = remaining as u128 * 2;
        let draw = rng.gen_range(0..span) / shares_left as u128;
        let cents = (draw as u64).max(MIN_SHARE.cents());

        debug_assert!(remaining - cents >= shares_left - 1);
        shares.push(Amount::from_cents(cents));
        remaining -= cents;
        shares_left -= 1;
    }
    shares.push(Amount::from_cents(remaining));

    shares.shuffle(rng);
    trace!(%fund, share_count, "fund partitioned");
    Ok(shares)
}
