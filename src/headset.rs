//! Seam to the XR runtime: pose sampling, haptics and display timing

use crate::assets::{DEFAULT_FRAME_RATE, VIEW_COUNT};
use crate::net::packets::{Haptics, Pose, Tracking};
use crate::pipeline::state::{frame_interval, sanitize_frame_rate};
use crate::pipeline::types::Timestamp;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub trait Headset: Send + Sync {
    /// Native display refresh rate in Hz
    fn refresh_rate(&self) -> f32;

    /// Head and eye poses predicted for the next display, sampled at `now`.
    /// `None` while the runtime has no valid pose.
    fn tracking(&self, now: Timestamp) -> Option<Tracking>;

    fn apply_haptics(&self, haptics: &Haptics);
}

/// Headless stand-in: a fixed pose at eye height, haptics only logged
pub struct DesktopHeadset {
    refresh_rate: f32,
    ipd: f32,
    haptics_applied: AtomicU64,
}

impl DesktopHeadset {
    pub fn new(refresh_rate: f32) -> Self {
        Self {
            refresh_rate: sanitize_frame_rate(refresh_rate).unwrap_or(DEFAULT_FRAME_RATE),
            ipd: 0.063,
            haptics_applied: AtomicU64::new(0),
        }
    }

    pub fn haptics_applied(&self) -> u64 {
        self.haptics_applied.load(Ordering::Relaxed)
    }

    fn frame_interval(&self) -> Duration {
        frame_interval(self.refresh_rate)
    }
}

impl Default for DesktopHeadset {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_RATE)
    }
}

impl Headset for DesktopHeadset {
    fn refresh_rate(&self) -> f32 {
        self.refresh_rate
    }

    fn tracking(&self, now: Timestamp) -> Option<Tracking> {
        let mut views = [Pose::IDENTITY; VIEW_COUNT];
        for (i, view) in views.iter_mut().enumerate() {
            let side = if i == 0 { -0.5 } else { 0.5 };
            view.position = [side * self.ipd, 1.6, 0.0];
        }

        Some(Tracking {
            timestamp: now.nanos,
            display_time: now.add(self.frame_interval()).nanos,
            views,
        })
    }

    fn apply_haptics(&self, haptics: &Haptics) {
        self.haptics_applied.fetch_add(1, Ordering::Relaxed);
        debug!(
            "DesktopHeadset: haptics {:?} {:.0} Hz x{:.2} for {} ns",
            haptics.device, haptics.frequency, haptics.amplitude, haptics.duration_ns
        );
    }
}
