use crate::amount::Amount;

/// Errors produced when parsing an [`Amount`] from text.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AmountParseError {
    #[error("amount is empty")]
    Empty,

    #[error("invalid character in amount: {0:?}")]
    InvalidCharacter(char),

    #[error("at most 2 decimal places are allowed, got {0}")]
    TooManyDecimals(usize),

    #[error("amount does not fit in 64-bit cents")]
    Overflow,
}

/// Errors that can occur while partitioning a fund.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// The fund cannot give every share at least [`crate::MIN_SHARE`].
    #[error("cannot split {fund} into {share_count} shares of at least 0.01")]
    InvalidConfiguration { fund: Amount, share_count: u32 },
}
