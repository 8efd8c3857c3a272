//! Health counters for the receiving engine
//!
//! Transport loss, stale or duplicate shards, decoder failures and audio
//! under/overflows are never errors: they are counted here and surfaced as a
//! [`HealthSummary`] for telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for a stream
///
/// All fields use atomic operations for thread-safe access.
#[derive(Default)]
pub struct StreamHealth {
    /// Shards accepted from the network
    pub shards_received: AtomicU64,

    /// Shards for a frame older than the one being accumulated
    pub shards_stale: AtomicU64,

    /// Shards already applied, or for a frame that already finished
    pub shards_duplicate: AtomicU64,

    /// Shards addressed to a sub-stream that does not exist
    pub shards_unrouted: AtomicU64,

    /// Shards with an index past the frame's last shard, or past the slot limit
    pub shards_malformed: AtomicU64,

    /// Frames fully reassembled and handed to a decoder
    pub frames_completed: AtomicU64,

    /// Partial frames dropped because a newer frame started
    pub frames_abandoned: AtomicU64,

    /// Partial frames dropped after the inactivity timeout
    pub frames_timed_out: AtomicU64,

    /// Number of decode failures
    pub decode_failures: AtomicU64,

    /// Decoded frames published as blit handles
    pub frames_decoded: AtomicU64,

    /// Render ticks where the accumulators had no frame in common
    pub common_frame_misses: AtomicU64,

    /// Speaker callbacks that had to pad with silence
    pub speaker_underflows: AtomicU64,

    /// Speaker frames dropped because the ring was full
    pub speaker_overflows: AtomicU64,

    /// Microphone buffers dropped because the ring was full
    pub microphone_overflows: AtomicU64,

    /// Total payload bytes received in shards
    pub bytes_received: AtomicU64,

    /// Packets sent to the server
    pub packets_sent: AtomicU64,

    /// Bytes put on the transport for those packets
    pub bytes_sent: AtomicU64,
}

impl StreamHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_shard(&self, size: usize) {
        self.shards_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sent(&self, size: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_shard(&self) {
        self.shards_stale.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate_shard(&self) {
        self.shards_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unrouted_shard(&self) {
        self.shards_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed_shard(&self) {
        self.shards_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_completed(&self) {
        self.frames_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_abandoned(&self) {
        self.frames_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_timeout(&self) {
        self.frames_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_common_frame_miss(&self) {
        self.common_frame_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_speaker_underflow(&self) {
        self.speaker_underflows.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_speaker_overflow(&self) {
        self.speaker_overflows.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_microphone_overflow(&self) {
        self.microphone_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames lost in transport, either superseded or timed out
    pub fn frames_lost(&self) -> u64 {
        self.frames_abandoned.load(Ordering::Relaxed) + self.frames_timed_out.load(Ordering::Relaxed)
    }

    /// Percentage of frames lost in transport over all frames seen
    pub fn frame_loss_rate(&self) -> f64 {
        let lost = self.frames_lost();
        let total = lost + self.frames_completed.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        (lost as f64 / total as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        HealthSummary {
            shards_received: load(&self.shards_received),
            shards_stale: load(&self.shards_stale),
            shards_duplicate: load(&self.shards_duplicate),
            frames_completed: load(&self.frames_completed),
            frames_lost: self.frames_lost(),
            frame_loss_rate: self.frame_loss_rate(),
            decode_failures: load(&self.decode_failures),
            frames_decoded: load(&self.frames_decoded),
            common_frame_misses: load(&self.common_frame_misses),
            speaker_underflows: load(&self.speaker_underflows),
            speaker_overflows: load(&self.speaker_overflows),
            microphone_overflows: load(&self.microphone_overflows),
            bytes_received: load(&self.bytes_received),
            packets_sent: load(&self.packets_sent),
            bytes_sent: load(&self.bytes_sent),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Default)]
pub struct HealthSummary {
    pub shards_received: u64,
    pub shards_stale: u64,
    pub shards_duplicate: u64,
    pub frames_completed: u64,
    pub frames_lost: u64,
    pub frame_loss_rate: f64,
    pub decode_failures: u64,
    pub frames_decoded: u64,
    pub common_frame_misses: u64,
    pub speaker_underflows: u64,
    pub speaker_overflows: u64,
    pub microphone_overflows: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} shards ({} stale, {} dup, {} bytes), {} frames ({} lost, {:.2}%), {} decoded, {} decode failures, {} sync misses, audio {}/{} spk under/over, {} mic over, tx {} packets ({} bytes)",
            self.shards_received,
            self.shards_stale,
            self.shards_duplicate,
            self.bytes_received,
            self.frames_completed,
            self.frames_lost,
            self.frame_loss_rate,
            self.frames_decoded,
            self.decode_failures,
            self.common_frame_misses,
            self.speaker_underflows,
            self.speaker_overflows,
            self.microphone_overflows,
            self.packets_sent,
            self.bytes_sent,
        )
    }
}
