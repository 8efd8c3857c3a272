//! Bounded ring of recently decoded frames, shared between the decoder
//! output and the render thread
//!
//! The ring holds at most [`RECENT_FRAMES`] handles. Pushing into a full
//! ring evicts the oldest handle; a renderer still holding that handle keeps
//! the image alive until it drops its `Arc`.

use crate::assets::RECENT_FRAMES;
use crate::decoder::VideoFrame;
use crate::net::packets::{TimingInfo, ViewInfo};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Timestamps recorded along a frame's path to the screen. `server` is on
/// the server clock, every other field is headset clock nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTimestamps {
    pub server: Option<TimingInfo>,
    pub received_first_packet: i64,
    pub received_last_packet: i64,
    pub sent_to_decoder: i64,
    pub received_from_decoder: i64,
}

/// A decoded image ready to be composed, plus everything needed to
/// reproject it and report its latency.
#[derive(Debug)]
pub struct BlitHandle {
    pub frame_id: u64,
    pub stream_index: u8,
    pub image: VideoFrame,
    pub view_info: Option<ViewInfo>,
    pub timestamps: FrameTimestamps,
    times_displayed: AtomicU8,
}

impl BlitHandle {
    pub fn new(
        frame_id: u64,
        stream_index: u8,
        image: VideoFrame,
        view_info: Option<ViewInfo>,
        timestamps: FrameTimestamps,
    ) -> Self {
        Self {
            frame_id,
            stream_index,
            image,
            view_info,
            timestamps,
            times_displayed: AtomicU8::new(0),
        }
    }

    /// Count one more presentation; returns the updated count (saturating)
    pub fn mark_displayed(&self) -> u8 {
        let previous = self
            .times_displayed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(1))
            })
            .unwrap_or(u8::MAX);
        previous.saturating_add(1)
    }

    pub fn times_displayed(&self) -> u8 {
        self.times_displayed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct FrameRing {
    handles: VecDeque<Arc<BlitHandle>>,
    capacity: usize,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new(RECENT_FRAMES)
    }
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            handles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append at the back; returns the evicted handle if the ring was full
    pub fn push(&mut self, handle: Arc<BlitHandle>) -> Option<Arc<BlitHandle>> {
        let evicted = if self.handles.len() >= self.capacity {
            self.handles.pop_front()
        } else {
            None
        };
        self.handles.push_back(handle);
        evicted
    }

    pub fn get(&self, frame_id: u64) -> Option<Arc<BlitHandle>> {
        self.handles
            .iter()
            .rev()
            .find(|h| h.frame_id == frame_id)
            .cloned()
    }

    /// Retained frame ids, oldest to newest
    pub fn ids(&self) -> Vec<u64> {
        self.handles.iter().map(|h| h.frame_id).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
