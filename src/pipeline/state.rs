//! Stream state management

use crate::assets::{DEFAULT_FRAME_RATE, MAX_FRAME_RATE, MIN_FRAME_RATE};
use std::time::{Duration, Instant};

/// Stream state machine
///
/// `Stalled` is recoverable: the stream goes back to `Streaming` as soon as a
/// new common frame is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No frame has been composed yet
    Initializing,

    /// New common frames keep arriving within the expected cadence
    Streaming,

    /// No new common frame for longer than the stall threshold
    Stalled,
}

impl StreamState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &StreamState) -> bool {
        use StreamState::*;

        match (self, target) {
            (Initializing, Streaming) => true,
            (Streaming, Stalled) => true,
            (Stalled, Streaming) => true,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            StreamState::Initializing => "Initializing",
            StreamState::Streaming => "Streaming",
            StreamState::Stalled => "Stalled",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamState::Streaming)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Drives [`StreamState`] from the outcome of each render tick
#[derive(Debug)]
pub struct StallDetector {
    state: StreamState,
    last_new_frame: Option<Instant>,
    frame_interval: Duration,
    multiplier: f32,
}

impl StallDetector {
    pub fn new(frame_rate: f32, multiplier: f32) -> Self {
        Self {
            state: StreamState::Initializing,
            last_new_frame: None,
            frame_interval: frame_interval(frame_rate),
            multiplier,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn set_frame_rate(&mut self, frame_rate: f32) {
        self.frame_interval = frame_interval(frame_rate);
    }

    /// Time without a new common frame after which the stream is stalled
    pub fn threshold(&self) -> Duration {
        Duration::try_from_secs_f32(self.frame_interval.as_secs_f32() * self.multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// Record the outcome of one render tick and return the resulting state
    pub fn update(&mut self, new_frame: bool, now: Instant) -> StreamState {
        let next = if new_frame {
            self.last_new_frame = Some(now);
            StreamState::Streaming
        } else {
            match (self.state, self.last_new_frame) {
                (StreamState::Streaming, Some(last))
                    if now.saturating_duration_since(last) > self.threshold() =>
                {
                    StreamState::Stalled
                }
                (state, _) => state,
            }
        };

        debug_assert!(self.state.can_transition_to(&next));
        if next != self.state {
            log::info!("Stream state: {} -> {}", self.state, next);
            self.state = next;
        }
        self.state
    }
}

/// Frame rate clamped to what a display can run at. Zero, negative and
/// non-finite rates read as unknown.
pub fn sanitize_frame_rate(frame_rate: f32) -> Option<f32> {
    (frame_rate.is_finite() && frame_rate > 0.0)
        .then(|| frame_rate.clamp(MIN_FRAME_RATE, MAX_FRAME_RATE))
}

/// Duration of one frame at `frame_rate`, the default rate if it is unknown
pub fn frame_interval(frame_rate: f32) -> Duration {
    let rate = sanitize_frame_rate(frame_rate).unwrap_or(DEFAULT_FRAME_RATE);
    Duration::from_secs_f32(1.0 / rate)
}
