//! Receiving engine pipeline
//!
//! - Control: stream state machine, stall detection and lifecycle
//! - Transport: the bounded shard queue between network and video threads
//! - Media: shard reassembly, decoding and frame synchronization
//! - Telemetry: health counters and the shared stream clock

pub mod clock;
pub mod health;
pub mod receiver;
pub mod state;
pub mod types;

pub use clock::StreamClock;
pub use health::{HealthSummary, StreamHealth};
pub use receiver::{RenderOutcome, Stream};
pub use state::{StallDetector, StreamState};
pub use types::Timestamp;
