pub mod clock;
pub mod config;
pub mod packet;
pub mod service;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{AllocatorConfig, HongbaoConfig};
pub use service::PacketService;
pub use types::*;
