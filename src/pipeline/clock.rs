//! Stream clock shared by every thread of the receiver

use std::sync::Arc;
use std::time::Instant;

use super::types::Timestamp;

/// Monotonic clock for stream timestamps
///
/// All feedback timestamps, timesync answers and audio timestamps produced by
/// the headset are expressed on this clock. Clones share the same base, so
/// timestamps taken on different threads are directly comparable.
#[derive(Clone)]
pub struct StreamClock {
    /// Base instant when the clock started
    base: Arc<Instant>,
}

impl StreamClock {
    /// Create a new stream clock starting now
    pub fn new() -> Self {
        Self {
            base: Arc::new(Instant::now()),
        }
    }

    pub fn base(&self) -> Instant {
        *self.base
    }

    /// Current time on the stream clock
    pub fn now(&self) -> Timestamp {
        Timestamp::from_duration(self.base.elapsed())
    }

    /// Get a timestamp relative to the clock base
    pub fn timestamp_from_instant(&self, instant: Instant) -> Timestamp {
        Timestamp::from_instant(instant, *self.base)
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClock")
            .field("elapsed", &self.base.elapsed())
            .finish()
    }
}
