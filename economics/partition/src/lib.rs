pub mod amount;
pub mod generator;
pub mod types;

pub use amount::{Amount, MIN_SHARE};
pub use generator::generate;
pub use types::*;
