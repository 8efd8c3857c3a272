//! Video stage: drains the shard queue into the per-sub-stream accumulators
//!
//! Runs on its own thread and is the only mutator of accumulator state. The
//! accumulator set itself is replaced by the network thread when a new video
//! layout arrives, so every access goes through the decoders mutex.

use crate::decoder::{DecoderFactory, ShardAccumulator};
use crate::net::packets::{VideoShard, VideoStreamDescription};
use crate::pipeline::clock::StreamClock;
use crate::pipeline::health::StreamHealth;
use crate::pipeline::receiver::coordinator::StreamShared;
use crate::utils::Pop;
use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A shard waiting for the video thread
pub struct QueuedShard {
    /// Layout the shard was received under
    pub generation: u64,
    pub received_at: Instant,
    pub shard: VideoShard,
}

/// Accumulators of the current video layout
#[derive(Default)]
pub struct DecoderSet {
    pub generation: u64,
    pub accumulators: Vec<ShardAccumulator>,
}

impl DecoderSet {
    /// Build one accumulator per sub-stream of `description`, replacing the
    /// current layout. On error the previous layout is left untouched.
    pub fn rebuild(
        &mut self,
        description: &VideoStreamDescription,
        factory: &DecoderFactory,
        health: &Arc<StreamHealth>,
        clock: &StreamClock,
        shard_timeout: Duration,
    ) -> Result<()> {
        let mut accumulators = Vec::with_capacity(description.items.len());
        for (index, item) in description.items.iter().enumerate() {
            let index = index as u8;
            let decoder = factory(index, item).with_context(|| {
                format!(
                    "Failed to create {} decoder for sub-stream {} ({}x{})",
                    item.codec, index, item.width, item.height
                )
            })?;
            accumulators.push(ShardAccumulator::new(
                index,
                decoder,
                health.clone(),
                clock.clone(),
                shard_timeout,
            ));
        }

        self.accumulators = accumulators;
        self.generation += 1;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.accumulators.clear();
        self.generation += 1;
    }

    /// Route one shard to its accumulator
    pub fn submit(&mut self, queued: QueuedShard, health: &StreamHealth) {
        if queued.generation != self.generation {
            health.record_unrouted_shard();
            return;
        }
        match self
            .accumulators
            .get_mut(queued.shard.stream_item_idx as usize)
        {
            Some(accumulator) => {
                accumulator.submit(queued.shard, queued.received_at);
            }
            None => health.record_unrouted_shard(),
        }
    }

    pub fn poll_timeouts(&mut self, now: Instant) {
        for accumulator in &mut self.accumulators {
            accumulator.poll_timeout(now);
        }
    }
}

/// Video thread body; returns once the shard queue is closed
pub(crate) fn run_video(shared: Arc<StreamShared>) {
    info!("VideoStage: started");

    let shard_timeout = shared.config.shard_timeout();
    let idle_poll = (shard_timeout / 2).max(Duration::from_millis(1));
    let mut last_poll = Instant::now();
    let mut shards = 0u64;

    loop {
        match shared.queue.pop_timeout(idle_poll) {
            Pop::Item(queued) => {
                shards += 1;
                let mut decoders = shared.lock_decoders();
                decoders.submit(queued, &shared.health);

                let now = Instant::now();
                if now.duration_since(last_poll) >= idle_poll {
                    decoders.poll_timeouts(now);
                    last_poll = now;
                }
            }
            Pop::Timeout => {
                let now = Instant::now();
                shared.lock_decoders().poll_timeouts(now);
                last_poll = now;
            }
            Pop::Closed => break,
        }
    }

    info!("VideoStage: finished ({} shards processed)", shards);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::default_decoder_factory;
    use crate::net::packets::{VideoCodec, VideoStreamItem};
    use bytes::Bytes;
    use std::sync::atomic::Ordering;

    fn layout(items: usize) -> VideoStreamDescription {
        VideoStreamDescription {
            width: 4 * items as u16,
            height: 2,
            fps: 90.0,
            items: (0..items)
                .map(|i| VideoStreamItem {
                    codec: VideoCodec::Raw,
                    width: 4,
                    height: 2,
                    offset_x: 4 * i as u16,
                    offset_y: 0,
                })
                .collect(),
        }
    }

    fn queued(generation: u64, stream: u8, frame: u64) -> QueuedShard {
        QueuedShard {
            generation,
            received_at: Instant::now(),
            shard: VideoShard {
                stream_item_idx: stream,
                frame_idx: frame,
                shard_idx: 0,
                shard_count_known: true,
                is_last: true,
                view_info: None,
                timing_info: None,
                payload: Bytes::from(vec![0u8; 12]),
            },
        }
    }

    #[test]
    fn test_routes_by_stream_index() {
        let health = Arc::new(StreamHealth::new());
        let mut set = DecoderSet::default();
        set.rebuild(
            &layout(2),
            &default_decoder_factory(),
            &health,
            &StreamClock::new(),
            Duration::from_millis(100),
        )
        .unwrap();

        set.submit(queued(set.generation, 1, 5), &health);
        set.submit(queued(set.generation, 2, 5), &health);

        assert!(set.accumulators[0].frames().is_empty());
        assert_eq!(set.accumulators[1].frames(), vec![5]);
        assert_eq!(health.shards_unrouted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drops_shards_from_previous_layout() {
        let health = Arc::new(StreamHealth::new());
        let clock = StreamClock::new();
        let factory = default_decoder_factory();
        let mut set = DecoderSet::default();
        set.rebuild(&layout(1), &factory, &health, &clock, Duration::from_millis(100))
            .unwrap();
        let old = set.generation;
        set.rebuild(&layout(1), &factory, &health, &clock, Duration::from_millis(100))
            .unwrap();

        set.submit(queued(old, 0, 1), &health);
        assert!(set.accumulators[0].frames().is_empty());
        assert_eq!(health.shards_unrouted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failed_rebuild_keeps_layout() {
        let health = Arc::new(StreamHealth::new());
        let clock = StreamClock::new();
        let mut set = DecoderSet::default();
        set.rebuild(
            &layout(2),
            &default_decoder_factory(),
            &health,
            &clock,
            Duration::from_millis(100),
        )
        .unwrap();
        let generation = set.generation;

        let failing: DecoderFactory =
            Arc::new(|_, _| Err(anyhow::anyhow!("out of decoder instances")));
        assert!(
            set.rebuild(&layout(3), &failing, &health, &clock, Duration::from_millis(100))
                .is_err()
        );
        assert_eq!(set.accumulators.len(), 2);
        assert_eq!(set.generation, generation);
    }
}
