//! Reassembly of encoded video frames from network shards
//!
//! One accumulator per sub-stream. Only the video thread calls
//! [`ShardAccumulator::submit`] and [`ShardAccumulator::poll_timeout`]; the
//! render thread reads decoded frames through the shared [`FrameRing`].
//!
//! The accumulator only ever moves forward: a shard for an older frame id is
//! dropped, and a shard for a newer id abandons whatever was being
//! assembled.

use super::VideoDecoder;
use crate::assets::MAX_SHARDS_PER_FRAME;
use crate::display::{BlitHandle, FrameRing, FrameTimestamps};
use crate::net::packets::{TimingInfo, VideoShard, ViewInfo};
use crate::pipeline::clock::StreamClock;
use crate::pipeline::health::StreamHealth;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Frames handed to a decoder whose output has not come back yet
const MAX_IN_DECODER: usize = 16;

/// What [`ShardAccumulator::submit`] did with a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOutcome {
    /// Stored; the frame is still missing shards
    Pending,
    /// Last missing shard; the frame went to the decoder
    Completed,
    /// Older than the frame being accumulated
    Stale,
    /// Shard index already received
    Duplicate,
    /// The frame already completed or was abandoned
    Finished,
    /// Index beyond the frame's last shard, or a last shard that does not
    /// carry the shard count
    Malformed,
}

struct AccumulationBuffer {
    frame_id: u64,
    slots: Vec<Option<Bytes>>,
    received: u32,
    last_index: Option<u32>,
    first_arrival: Instant,
    last_arrival: Instant,
    view_info: Option<ViewInfo>,
    timing_info: Option<TimingInfo>,
}

impl AccumulationBuffer {
    fn new(frame_id: u64, now: Instant) -> Self {
        Self {
            frame_id,
            slots: Vec::new(),
            received: 0,
            last_index: None,
            first_arrival: now,
            last_arrival: now,
            view_info: None,
            timing_info: None,
        }
    }

    fn insert(&mut self, shard: VideoShard, now: Instant) -> ShardOutcome {
        let index = shard.shard_idx;
        if index >= MAX_SHARDS_PER_FRAME || (shard.is_last && !shard.shard_count_known) {
            return ShardOutcome::Malformed;
        }
        if let Some(last) = self.last_index {
            if index > last || (shard.is_last && index != last) {
                return ShardOutcome::Malformed;
            }
        } else if shard.is_last
            && self.slots.iter().skip(index as usize + 1).any(Option::is_some)
        {
            return ShardOutcome::Malformed;
        }

        let slot = index as usize;
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, None);
        }
        if self.slots[slot].is_some() {
            return ShardOutcome::Duplicate;
        }

        self.slots[slot] = Some(shard.payload);
        self.received += 1;
        self.last_arrival = now;
        if shard.is_last {
            self.last_index = Some(index);
        }
        if self.view_info.is_none() {
            self.view_info = shard.view_info;
        }
        if self.timing_info.is_none() {
            self.timing_info = shard.timing_info;
        }

        if self.is_complete() {
            ShardOutcome::Completed
        } else {
            ShardOutcome::Pending
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.last_index, Some(last) if self.received == last + 1)
    }

    /// Concatenate the payload in shard order
    fn assemble(&mut self) -> Bytes {
        let size = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(size);
        for payload in self.slots.drain(..).flatten() {
            data.extend_from_slice(&payload);
        }
        data.freeze()
    }
}

struct PendingDecode {
    frame_id: u64,
    view_info: Option<ViewInfo>,
    timestamps: FrameTimestamps,
}

pub struct ShardAccumulator {
    stream_index: u8,
    decoder: Box<dyn VideoDecoder>,
    ring: Arc<Mutex<FrameRing>>,
    health: Arc<StreamHealth>,
    clock: StreamClock,
    shard_timeout: Duration,

    current_frame_id: Option<u64>,
    /// `None` once the current frame completed or was abandoned
    buffer: Option<AccumulationBuffer>,
    /// Whether the current frame id went to the decoder, as opposed to timing out
    current_completed: bool,
    in_decoder: VecDeque<PendingDecode>,

    frames_completed: u64,
    frames_lost: u64,
}

impl ShardAccumulator {
    pub fn new(
        stream_index: u8,
        decoder: Box<dyn VideoDecoder>,
        health: Arc<StreamHealth>,
        clock: StreamClock,
        shard_timeout: Duration,
    ) -> Self {
        info!("ShardAccumulator[{}]: started", stream_index);
        Self {
            stream_index,
            decoder,
            ring: Arc::new(Mutex::new(FrameRing::default())),
            health,
            clock,
            shard_timeout,
            current_frame_id: None,
            buffer: None,
            current_completed: false,
            in_decoder: VecDeque::new(),
            frames_completed: 0,
            frames_lost: 0,
        }
    }

    pub fn stream_index(&self) -> u8 {
        self.stream_index
    }

    /// Frame id being accumulated (or last finished), if any shard arrived yet
    pub fn current_frame_id(&self) -> Option<u64> {
        self.current_frame_id
    }

    /// Handle to the decoded-frame ring, shared with the render side
    pub fn ring(&self) -> Arc<Mutex<FrameRing>> {
        self.ring.clone()
    }

    /// Apply one shard received at `now`
    pub fn submit(&mut self, shard: VideoShard, now: Instant) -> ShardOutcome {
        self.poll_timeout(now);

        let frame_id = shard.frame_idx;
        match self.current_frame_id {
            Some(current) if frame_id < current => {
                self.health.record_stale_shard();
                return ShardOutcome::Stale;
            }
            Some(current) if frame_id == current && self.buffer.is_none() => {
                // A timed-out frame's late shards count as stale
                if self.current_completed {
                    self.health.record_duplicate_shard();
                } else {
                    self.health.record_stale_shard();
                }
                return ShardOutcome::Finished;
            }
            Some(current) if frame_id == current => {}
            _ => {
                if let Some(abandoned) = self.buffer.take() {
                    debug!(
                        "ShardAccumulator[{}]: frame {} superseded by {} ({} shards received)",
                        self.stream_index, abandoned.frame_id, frame_id, abandoned.received
                    );
                    self.health.record_frame_abandoned();
                    self.frames_lost += 1;
                }
                self.current_frame_id = Some(frame_id);
                self.current_completed = false;
                self.buffer = Some(AccumulationBuffer::new(frame_id, now));
            }
        }

        let Some(buffer) = self.buffer.as_mut() else {
            return ShardOutcome::Finished;
        };

        let outcome = buffer.insert(shard, now);
        match outcome {
            ShardOutcome::Duplicate => self.health.record_duplicate_shard(),
            ShardOutcome::Malformed => self.health.record_malformed_shard(),
            ShardOutcome::Completed => {
                self.current_completed = true;
                if let Some(buffer) = self.buffer.take() {
                    self.complete(buffer, now);
                }
            }
            _ => {}
        }
        outcome
    }

    /// Abandon the current frame if no shard arrived for longer than the
    /// shard timeout. Returns true if a frame was dropped.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        let expired = self
            .buffer
            .as_ref()
            .is_some_and(|b| now.saturating_duration_since(b.last_arrival) > self.shard_timeout);

        if expired {
            if let Some(buffer) = self.buffer.take() {
                debug!(
                    "ShardAccumulator[{}]: frame {} timed out ({} shards received)",
                    self.stream_index, buffer.frame_id, buffer.received
                );
            }
            self.health.record_frame_timeout();
            self.frames_lost += 1;
        }
        expired
    }

    /// Decoded frame with the given id, if still retained
    pub fn frame(&self, frame_id: u64) -> Option<Arc<BlitHandle>> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).get(frame_id)
    }

    /// Ids of retained decoded frames, oldest to newest
    pub fn frames(&self) -> Vec<u64> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).ids()
    }

    fn complete(&mut self, mut buffer: AccumulationBuffer, now: Instant) {
        self.health.record_frame_completed();
        self.frames_completed += 1;

        let data = buffer.assemble();
        let timestamps = FrameTimestamps {
            server: buffer.timing_info,
            received_first_packet: self.clock.timestamp_from_instant(buffer.first_arrival).nanos,
            received_last_packet: self.clock.timestamp_from_instant(now).nanos,
            sent_to_decoder: self.clock.now().nanos,
            received_from_decoder: 0,
        };

        if self.in_decoder.len() >= MAX_IN_DECODER {
            self.in_decoder.pop_front();
        }
        self.in_decoder.push_back(PendingDecode {
            frame_id: buffer.frame_id,
            view_info: buffer.view_info,
            timestamps,
        });

        match self.decoder.decode(buffer.frame_id, &data) {
            Ok(decoded) => {
                for frame in decoded {
                    self.publish(frame.frame_id, frame.image);
                }
            }
            Err(e) => {
                warn!(
                    "ShardAccumulator[{}]: skipping frame {}: {}",
                    self.stream_index, buffer.frame_id, e
                );
                self.health.record_decode_failure();
                self.in_decoder.retain(|p| p.frame_id != buffer.frame_id);
            }
        }
    }

    fn publish(&mut self, frame_id: u64, image: super::VideoFrame) {
        // Anything queued before this id was dropped by the decoder
        while self
            .in_decoder
            .front()
            .is_some_and(|p| p.frame_id < frame_id)
        {
            self.in_decoder.pop_front();
        }
        let pending = match self.in_decoder.front() {
            Some(p) if p.frame_id == frame_id => self.in_decoder.pop_front(),
            _ => None,
        };

        let (view_info, mut timestamps) = pending
            .map(|p| (p.view_info, p.timestamps))
            .unwrap_or_default();
        timestamps.received_from_decoder = self.clock.now().nanos;

        let handle = Arc::new(BlitHandle::new(
            frame_id,
            self.stream_index,
            image,
            view_info,
            timestamps,
        ));
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        self.health.record_frame_decoded();
    }
}

impl Drop for ShardAccumulator {
    fn drop(&mut self) {
        info!(
            "ShardAccumulator[{}]: finished ({} frames completed, {} lost)",
            self.stream_index, self.frames_completed, self.frames_lost
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::RECENT_FRAMES;
    use crate::decoder::{DecodedFrame, VideoFrame};
    use anyhow::{Result, bail};
    use std::sync::atomic::Ordering;

    /// Emits the assembled payload as the image, failing on a marker byte
    struct EchoDecoder {
        calls: Arc<Mutex<Vec<u64>>>,
    }

    impl VideoDecoder for EchoDecoder {
        fn decode(&mut self, frame_id: u64, data: &[u8]) -> Result<Vec<DecodedFrame>> {
            self.calls.lock().unwrap().push(frame_id);
            if data.first() == Some(&0xEE) {
                bail!("corrupt access unit");
            }
            Ok(vec![DecodedFrame {
                frame_id,
                image: VideoFrame {
                    data: data.to_vec(),
                    width: 1,
                    height: 1,
                },
            }])
        }
    }

    struct Fixture {
        acc: ShardAccumulator,
        calls: Arc<Mutex<Vec<u64>>>,
        health: Arc<StreamHealth>,
        start: Instant,
    }

    fn fixture() -> Fixture {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let health = Arc::new(StreamHealth::new());
        let acc = ShardAccumulator::new(
            0,
            Box::new(EchoDecoder {
                calls: calls.clone(),
            }),
            health.clone(),
            StreamClock::new(),
            Duration::from_millis(100),
        );
        Fixture {
            acc,
            calls,
            health,
            start: Instant::now(),
        }
    }

    fn shard(frame_idx: u64, shard_idx: u32, is_last: bool, payload: &[u8]) -> VideoShard {
        VideoShard {
            stream_item_idx: 0,
            frame_idx,
            shard_idx,
            shard_count_known: is_last,
            is_last,
            view_info: None,
            timing_info: None,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_in_order_completion() {
        let mut f = fixture();
        let now = f.start;
        assert_eq!(f.acc.submit(shard(1, 0, false, b"ab"), now), ShardOutcome::Pending);
        assert_eq!(f.acc.submit(shard(1, 1, false, b"cd"), now), ShardOutcome::Pending);
        assert_eq!(f.acc.submit(shard(1, 2, true, b"e"), now), ShardOutcome::Completed);

        assert_eq!(f.acc.frames(), vec![1]);
        assert_eq!(f.acc.frame(1).unwrap().image.data, b"abcde");
        assert_eq!(*f.calls.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_any_order_completes_exactly_once() {
        // Deterministic permutations of a 6-shard frame, with repeats
        let mut seed = 12345u64;
        for frame in 1..=40u64 {
            let mut order: Vec<u32> = (0..6).chain([2, 4]).collect();
            for i in (1..order.len()).rev() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (seed >> 33) as usize % (i + 1));
            }

            let mut f = fixture();
            let mut completions = 0;
            for idx in order {
                let payload = [idx as u8];
                if f.acc.submit(shard(frame, idx, idx == 5, &payload), f.start)
                    == ShardOutcome::Completed
                {
                    completions += 1;
                }
            }
            assert_eq!(completions, 1);
            assert_eq!(f.acc.frame(frame).unwrap().image.data, vec![0, 1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut f = fixture();
        assert_eq!(f.acc.submit(shard(3, 0, false, b"x"), f.start), ShardOutcome::Pending);
        assert_eq!(f.acc.submit(shard(3, 0, false, b"y"), f.start), ShardOutcome::Duplicate);
        assert_eq!(f.acc.submit(shard(3, 1, true, b"z"), f.start), ShardOutcome::Completed);

        assert_eq!(f.acc.frame(3).unwrap().image.data, b"xz");
        assert_eq!(f.health.shards_duplicate.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stale_never_rewinds() {
        let mut f = fixture();
        f.acc.submit(shard(10, 0, false, b"a"), f.start);
        assert_eq!(f.acc.submit(shard(9, 0, true, b"b"), f.start), ShardOutcome::Stale);
        assert_eq!(f.acc.current_frame_id(), Some(10));

        let mut last = 0;
        for id in [12, 11, 15, 13, 15, 14, 20] {
            f.acc.submit(shard(id, 0, false, b"a"), f.start);
            let current = f.acc.current_frame_id().unwrap();
            assert!(current >= last);
            last = current;
        }
        assert_eq!(last, 20);
        assert!(f.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_newer_frame_abandons_incomplete() {
        let mut f = fixture();
        f.acc.submit(shard(1, 0, false, b"a"), f.start);
        assert_eq!(f.acc.submit(shard(2, 0, true, b"b"), f.start), ShardOutcome::Completed);

        // The rest of frame 1 arrives too late
        assert_eq!(f.acc.submit(shard(1, 1, true, b"c"), f.start), ShardOutcome::Stale);

        assert_eq!(f.acc.frames(), vec![2]);
        assert_eq!(f.health.frames_abandoned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_finished_frame_ignores_late_shards() {
        let mut f = fixture();
        f.acc.submit(shard(4, 0, true, b"a"), f.start);
        assert_eq!(f.acc.submit(shard(4, 0, true, b"a"), f.start), ShardOutcome::Finished);
        assert_eq!(f.acc.submit(shard(4, 1, false, b"b"), f.start), ShardOutcome::Finished);
        assert_eq!(f.calls.lock().unwrap().len(), 1);
        assert_eq!(f.health.shards_duplicate.load(Ordering::Relaxed), 2);
        assert_eq!(f.health.shards_stale.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_timeout_abandons_frame() {
        let mut f = fixture();
        f.acc.submit(shard(1, 0, false, b"a"), f.start);

        assert!(!f.acc.poll_timeout(f.start + Duration::from_millis(50)));
        assert!(f.acc.poll_timeout(f.start + Duration::from_millis(150)));
        assert!(!f.acc.poll_timeout(f.start + Duration::from_millis(300)));

        // The missing shard shows up after the timeout
        let late = f.start + Duration::from_millis(400);
        assert_eq!(f.acc.submit(shard(1, 1, true, b"b"), late), ShardOutcome::Finished);
        assert_eq!(f.health.frames_timed_out.load(Ordering::Relaxed), 1);
        assert_eq!(f.health.shards_stale.load(Ordering::Relaxed), 1);
        assert_eq!(f.health.shards_duplicate.load(Ordering::Relaxed), 0);
        assert!(f.acc.frames().is_empty());
    }

    #[test]
    fn test_timeout_checked_on_submit() {
        let mut f = fixture();
        f.acc.submit(shard(1, 0, false, b"a"), f.start);
        let later = f.start + Duration::from_millis(200);
        assert_eq!(f.acc.submit(shard(1, 1, true, b"b"), later), ShardOutcome::Finished);
        assert_eq!(f.health.frames_timed_out.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_decoder_failure_is_skipped() {
        let mut f = fixture();
        assert_eq!(f.acc.submit(shard(1, 0, true, &[0xEE]), f.start), ShardOutcome::Completed);
        assert_eq!(f.acc.submit(shard(2, 0, true, b"ok"), f.start), ShardOutcome::Completed);

        assert_eq!(f.acc.frames(), vec![2]);
        assert_eq!(f.health.decode_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_index_past_last_is_malformed() {
        let mut f = fixture();
        f.acc.submit(shard(1, 1, true, b"b"), f.start);
        assert_eq!(f.acc.submit(shard(1, 2, false, b"c"), f.start), ShardOutcome::Malformed);
        assert_eq!(f.acc.submit(shard(1, 0, false, b"a"), f.start), ShardOutcome::Completed);
        assert_eq!(f.acc.frame(1).unwrap().image.data, b"ab");
    }

    #[test]
    fn test_last_shard_without_count_is_malformed() {
        let mut f = fixture();
        let mut last = shard(1, 1, true, b"b");
        last.shard_count_known = false;
        assert_eq!(f.acc.submit(last, f.start), ShardOutcome::Malformed);
        assert_eq!(f.health.shards_malformed.load(Ordering::Relaxed), 1);

        assert_eq!(f.acc.submit(shard(1, 0, false, b"a"), f.start), ShardOutcome::Pending);
        assert_eq!(f.acc.submit(shard(1, 1, true, b"b"), f.start), ShardOutcome::Completed);
        assert_eq!(f.acc.frame(1).unwrap().image.data, b"ab");
    }

    #[test]
    fn test_ring_keeps_three_most_recent() {
        let mut f = fixture();
        for id in 1..=5 {
            f.acc.submit(shard(id, 0, true, b"p"), f.start);
        }
        assert_eq!(f.acc.frames().len(), RECENT_FRAMES);
        assert_eq!(f.acc.frames(), vec![3, 4, 5]);
        assert!(f.acc.frame(2).is_none());
    }

    #[test]
    fn test_handle_metadata() {
        let mut f = fixture();
        let mut first = shard(7, 0, false, b"a");
        first.view_info = Some(ViewInfo {
            display_time: 99,
            ..Default::default()
        });
        let timing = TimingInfo {
            encode_begin: 10,
            encode_end: 20,
            send_begin: 30,
            send_end: 40,
        };
        first.timing_info = Some(timing);
        f.acc.submit(first, f.start);
        f.acc.submit(shard(7, 1, true, b"b"), f.start + Duration::from_millis(5));

        let handle = f.acc.frame(7).unwrap();
        assert_eq!(handle.stream_index, 0);
        assert_eq!(handle.view_info.unwrap().display_time, 99);
        let ts = handle.timestamps;
        assert_eq!(ts.server, Some(timing));
        assert!(ts.received_last_packet >= ts.received_first_packet);
        assert!(ts.received_from_decoder >= ts.sent_to_decoder);
    }
}
