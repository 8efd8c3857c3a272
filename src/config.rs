//! Runtime configuration for the receiving engine
//!
//! Every field has a default taken from [`crate::assets`], so an empty JSON
//! object is a valid configuration file.

use crate::assets::{
    AUDIO_STOP_TIMEOUT, DEFAULT_FRAME_RATE, MICROPHONE_RING_CAPACITY, RECEIVE_POLL_INTERVAL,
    SHARD_QUEUE_CAPACITY, SHARD_TIMEOUT, SPEAKER_RING_CAPACITY, STALL_MULTIPLIER,
    TRACKING_INTERVAL,
};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Inactivity bound after which a partial frame is abandoned (milliseconds)
    pub shard_timeout_ms: u64,
    /// Bound of the network → decode hand-off queue
    pub shard_queue_capacity: usize,
    /// Stall after `stall_multiplier` frame intervals without a new common frame
    pub stall_multiplier: f32,
    /// Frame rate assumed until the server announces one
    pub default_frame_rate: f32,
    pub tracking_interval_ms: u64,
    pub speaker_ring_capacity: usize,
    pub microphone_ring_capacity: usize,
    pub enable_microphone: bool,
    pub audio_stop_timeout_ms: u64,
    pub receive_poll_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            shard_timeout_ms: SHARD_TIMEOUT.as_millis() as u64,
            shard_queue_capacity: SHARD_QUEUE_CAPACITY,
            stall_multiplier: STALL_MULTIPLIER,
            default_frame_rate: DEFAULT_FRAME_RATE,
            tracking_interval_ms: TRACKING_INTERVAL.as_millis() as u64,
            speaker_ring_capacity: SPEAKER_RING_CAPACITY,
            microphone_ring_capacity: MICROPHONE_RING_CAPACITY,
            enable_microphone: false,
            audio_stop_timeout_ms: AUDIO_STOP_TIMEOUT.as_millis() as u64,
            receive_poll_interval_ms: RECEIVE_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl StreamConfig {
    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: StreamConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_queue_capacity == 0 {
            return Err(anyhow!("shard_queue_capacity must be at least 1"));
        }
        if self.speaker_ring_capacity == 0 || self.microphone_ring_capacity == 0 {
            return Err(anyhow!("audio ring capacities must be at least 1"));
        }
        if !(self.default_frame_rate > 0.0) {
            return Err(anyhow!("default_frame_rate must be positive"));
        }
        if self.tracking_interval_ms == 0 || self.receive_poll_interval_ms == 0 {
            return Err(anyhow!("tracking and receive poll intervals must be at least 1 ms"));
        }
        if !(self.stall_multiplier >= 1.0) {
            return Err(anyhow!("stall_multiplier must be at least 1"));
        }
        Ok(())
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }

    pub fn tracking_interval(&self) -> Duration {
        Duration::from_millis(self.tracking_interval_ms)
    }

    pub fn audio_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_stop_timeout_ms)
    }

    pub fn receive_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receive_poll_interval_ms)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
