pub mod latency;
pub mod memory;
pub mod types;

pub use latency::LatencyStore;
pub use memory::MemoryStore;
pub use types::*;
