use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::AmountParseError;

/// Smallest share a claimant can receive (one cent).
pub const MIN_SHARE: Amount = Amount(1);

/// Monetary amount with two decimal places, stored as integer cents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// `self * n`, or `None` on overflow.
    pub fn checked_mul(self, n: u64) -> Option<Amount> {
        self.0.checked_mul(n).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    /// Parses `"12"`, `"12.3"` or `"12.34"`. Anything finer than a cent is rejected
    /// rather than rounded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(AmountParseError::Empty);
        }
        if frac.len() > 2 {
            return Err(AmountParseError::TooManyDecimals(frac.len()));
        }

        let mut cents: u64 = 0;
        for c in whole.chars() {
            let digit = c.to_digit(10).ok_or(AmountParseError::InvalidCharacter(c))?;
            cents = cents
                .checked_mul(10)
                .and_then(|v| v.checked_add(digit as u64))
                .ok_or(AmountParseError::Overflow)?;
        }
        cents = cents.checked_mul(100).ok_or(AmountParseError::Overflow)?;

        let mut scale = 10;
        for c in frac.chars() {
            let digit = c.to_digit(10).ok_or(AmountParseError::InvalidCharacter(c))?;
            cents = cents
                .checked_add(digit as u64 * scale)
                .ok_or(AmountParseError::Overflow)?;
            scale /= 10;
        }

        Ok(Amount(cents))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        Amount(iter.map(|a| a.0).sum())
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        Amount(iter.map(|a| a.0).sum())
    }
}
