//! Receiver threads and the stream controller
//!
//! ```text
//! NetworkStage → SyncQueue → VideoStage → ShardAccumulator → FrameRing → Stream::render
//! ```

pub mod coordinator;
pub mod decode_stage;
pub mod receive_stage;
pub mod sync_stage;
pub mod tracking_stage;

pub use coordinator::{ComposedFrame, RenderOutcome, Stream};
pub use decode_stage::{DecoderSet, QueuedShard};
pub use sync_stage::common_frame;
