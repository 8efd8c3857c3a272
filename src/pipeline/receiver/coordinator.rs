//! Stream controller
//!
//! Owns the stream threads and the state they share:
//!
//! ```text
//! Session → NetworkStage ──shards──▶ SyncQueue ──▶ VideoStage → accumulators → rings
//!                │                                                              │
//!                ├─ audio ─▶ AudioBridge ◀─ device callbacks                    │
//!                └─ timesync / haptics                          render() ◀──────┘
//! TrackingStage → Session
//! ```
//!
//! The render tick is driven by the caller through [`Stream::render`].
//! Teardown order: shard queue shutdown, thread join, audio stop handshake,
//! resource release.

use crate::audio::{AudioBackend, AudioBridge, get_audio_description};
use crate::config::StreamConfig;
use crate::decoder::{DecoderFactory, default_decoder_factory};
use crate::display::{BlitHandle, FrameRing};
use crate::headset::Headset;
use crate::net::packets::{Feedback, FromHeadset, HeadsetInfo};
use crate::net::session::Session;
use crate::pipeline::clock::StreamClock;
use crate::pipeline::health::StreamHealth;
use crate::pipeline::receiver::decode_stage::{DecoderSet, QueuedShard, run_video};
use crate::pipeline::receiver::receive_stage::NetworkStage;
use crate::pipeline::receiver::sync_stage::common_frame;
use crate::pipeline::receiver::tracking_stage::run_tracking;
use crate::pipeline::state::{StallDetector, StreamState, sanitize_frame_rate};
use crate::utils::{SignalOfStop, SyncQueue};
use anyhow::{Context, Result, anyhow};
use log::{debug, error, info};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// State shared by the stream threads
pub(crate) struct StreamShared {
    pub config: StreamConfig,
    pub session: Arc<dyn Session>,
    pub headset: Arc<dyn Headset>,
    pub audio_backend: Arc<dyn AudioBackend>,
    pub decoder_factory: DecoderFactory,
    pub headset_info: HeadsetInfo,
    pub health: Arc<StreamHealth>,
    pub clock: StreamClock,
    /// The `exiting` flag
    pub sos: SignalOfStop,
    pub queue: SyncQueue<QueuedShard>,
    /// Lock order: decoders, then any ring
    decoders: Mutex<DecoderSet>,
    audio: Mutex<Option<AudioBridge>>,
    frame_rate: AtomicU32,
    fatal: Mutex<Option<anyhow::Error>>,
}

impl StreamShared {
    pub fn lock_decoders(&self) -> MutexGuard<'_, DecoderSet> {
        self.decoders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lock_audio(&self) -> MutexGuard<'_, Option<AudioBridge>> {
        self.audio.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn frame_rate(&self) -> f32 {
        f32::from_bits(self.frame_rate.load(Ordering::Relaxed))
    }

    /// Unusable rates from the server keep the previous one
    pub fn set_frame_rate(&self, fps: f32) {
        if let Some(fps) = sanitize_frame_rate(fps) {
            self.frame_rate.store(fps.to_bits(), Ordering::Relaxed);
        }
    }

    /// Send one packet to the server, counting what went on the wire
    pub fn send(&self, packet: FromHeadset) -> Result<()> {
        let size = self.session.send(packet)?;
        self.health.record_sent(size);
        Ok(())
    }

    /// Record a fatal error and stop every thread. The first error wins.
    pub fn fail(&self, err: anyhow::Error) {
        error!("Stream: fatal error: {:#}", err);
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.sos.cancel();
        self.queue.close();
    }
}

/// Frame composed by a render tick: one handle per sub-stream, same frame id
#[derive(Debug, Clone)]
pub struct ComposedFrame {
    pub frame_id: u64,
    pub handles: Vec<Arc<BlitHandle>>,
    /// False when the same frame as the previous tick is shown again
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub state: StreamState,
    /// `None`: keep showing the last composed frame
    pub frame: Option<ComposedFrame>,
}

struct RenderState {
    detector: StallDetector,
    last_composed: Option<u64>,
}

pub struct Stream {
    shared: Arc<StreamShared>,
    render: Mutex<RenderState>,
    threads: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl Stream {
    /// Start the stream threads with the decoders available in this build
    pub fn start(
        config: StreamConfig,
        session: Arc<dyn Session>,
        headset: Arc<dyn Headset>,
        audio_backend: Arc<dyn AudioBackend>,
    ) -> Result<Self> {
        Self::start_with_decoders(
            config,
            session,
            headset,
            audio_backend,
            default_decoder_factory(),
        )
    }

    pub fn start_with_decoders(
        config: StreamConfig,
        session: Arc<dyn Session>,
        headset: Arc<dyn Headset>,
        audio_backend: Arc<dyn AudioBackend>,
        decoder_factory: DecoderFactory,
    ) -> Result<Self> {
        config.validate()?;

        let headset_info = HeadsetInfo {
            refresh_rate: headset.refresh_rate(),
            audio: get_audio_description(&*audio_backend, config.enable_microphone),
        };

        let shared = Arc::new(StreamShared {
            queue: SyncQueue::new(config.shard_queue_capacity),
            frame_rate: AtomicU32::new(config.default_frame_rate.to_bits()),
            config,
            session,
            headset,
            audio_backend,
            decoder_factory,
            headset_info,
            health: Arc::new(StreamHealth::new()),
            clock: StreamClock::new(),
            sos: SignalOfStop::new(),
            decoders: Mutex::new(DecoderSet::default()),
            audio: Mutex::new(None),
            fatal: Mutex::new(None),
        });

        let render = Mutex::new(RenderState {
            detector: StallDetector::new(
                shared.config.default_frame_rate,
                shared.config.stall_multiplier,
            ),
            last_composed: None,
        });

        let mut stream = Self {
            shared: shared.clone(),
            render,
            threads: Vec::with_capacity(3),
            stopped: false,
        };

        // Advertise capabilities before any media flows
        shared
            .send(FromHeadset::HeadsetInfo(headset_info))
            .context("Failed to send headset info")?;

        let network = NetworkStage::new(shared.clone());
        stream.spawn("xrcast-network", move || network.run())?;
        let video = shared.clone();
        stream.spawn("xrcast-video", move || run_video(video))?;
        let tracking = shared.clone();
        stream.spawn("xrcast-tracking", move || run_tracking(tracking))?;

        info!(
            "Stream: started ({} Hz display, microphone {})",
            headset_info.refresh_rate,
            if headset_info.audio.microphone_enabled() {
                "on"
            } else {
                "off"
            }
        );
        Ok(stream)
    }

    fn spawn(&mut self, name: &str, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .with_context(|| format!("Failed to spawn {} thread", name))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Capabilities advertised to the server
    pub fn headset_info(&self) -> HeadsetInfo {
        self.shared.headset_info
    }

    pub fn health(&self) -> Arc<StreamHealth> {
        self.shared.health.clone()
    }

    pub fn clock(&self) -> StreamClock {
        self.shared.clock.clone()
    }

    pub fn current_state(&self) -> StreamState {
        self.lock_render().detector.state()
    }

    /// False once the stream stopped, on request or after a fatal error
    pub fn alive(&self) -> bool {
        !self.shared.sos.cancelled()
    }

    /// Take the fatal error that stopped the stream, if any
    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn lock_render(&self) -> MutexGuard<'_, RenderState> {
        self.render.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One render tick at `now`: pick the most recent frame every sub-stream
    /// has decoded, report it to the server the first time it is shown, and
    /// advance the stream state.
    pub fn render(&self, now: Instant) -> Result<RenderOutcome> {
        if let Some(err) = self
            .shared
            .fatal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            return Err(anyhow!("stream stopped: {:#}", err));
        }

        let (rings, preferred) = {
            let decoders = self.shared.lock_decoders();
            let rings: Vec<Arc<Mutex<FrameRing>>> =
                decoders.accumulators.iter().map(|a| a.ring()).collect();
            let preferred = decoders
                .accumulators
                .iter()
                .filter_map(|a| a.current_frame_id())
                .max()
                .unwrap_or(u64::MAX);
            (rings, preferred)
        };

        let handles = self.compose(&rings, preferred);

        let mut render = self.lock_render();
        render.detector.set_frame_rate(self.shared.frame_rate());

        let frame = handles.map(|handles| {
            let frame_id = handles[0].frame_id;
            let is_new = render.last_composed.is_none_or(|last| frame_id > last);
            if is_new {
                render.last_composed = Some(frame_id);
            }
            ComposedFrame {
                frame_id,
                handles,
                is_new,
            }
        });
        let state = render
            .detector
            .update(frame.as_ref().is_some_and(|f| f.is_new), now);
        drop(render);

        if let Some(frame) = &frame {
            self.report_displayed(frame, now);
        }

        Ok(RenderOutcome { state, frame })
    }

    fn compose(&self, rings: &[Arc<Mutex<FrameRing>>], preferred: u64) -> Option<Vec<Arc<BlitHandle>>> {
        if rings.is_empty() {
            return None;
        }

        let sets: Vec<Vec<u64>> = rings
            .iter()
            .map(|ring| ring.lock().unwrap_or_else(|e| e.into_inner()).ids())
            .collect();

        let handles = common_frame(&sets, preferred).and_then(|frame_id| {
            rings
                .iter()
                .map(|ring| ring.lock().unwrap_or_else(|e| e.into_inner()).get(frame_id))
                .collect::<Option<Vec<_>>>()
        });

        if handles.is_none() {
            self.shared.health.record_common_frame_miss();
        }
        handles
    }

    fn report_displayed(&self, frame: &ComposedFrame, now: Instant) {
        let clock = &self.shared.clock;
        let displayed = clock.timestamp_from_instant(now).nanos;

        for handle in &frame.handles {
            // Only the first presentation is reported
            if handle.mark_displayed() != 1 {
                continue;
            }
            let feedback = Feedback {
                stream_index: handle.stream_index,
                frame_index: handle.frame_id,
                received_first_packet: handle.timestamps.received_first_packet,
                received_last_packet: handle.timestamps.received_last_packet,
                sent_to_decoder: handle.timestamps.sent_to_decoder,
                received_from_decoder: handle.timestamps.received_from_decoder,
                blitted: clock.now().nanos,
                displayed,
                times_displayed: 1,
                server_timing: handle.timestamps.server,
            };
            if let Err(e) = self.shared.send(FromHeadset::Feedback(feedback)) {
                debug!("Stream: feedback send failed: {:#}", e);
            }
        }
    }

    /// Stop every thread and release decoders and audio. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shared.sos.cancel();
        self.shared.queue.close();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Stream: a stream thread panicked");
            }
        }

        if let Some(mut bridge) = self.shared.lock_audio().take() {
            bridge.close();
        }
        self.shared.lock_decoders().clear();

        info!("Stream: finished ({})", self.shared.health.summary());
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ClockedBackend;
    use crate::headset::DesktopHeadset;
    use crate::net::packets::{
        AudioData, AudioFormat, AudioStreamDescription, Handshake, Haptics, HapticsDevice,
        TimesyncQuery, TimingInfo, ToHeadset, VideoCodec, VideoShard, VideoStreamDescription,
        VideoStreamItem,
    };
    use crate::net::session::LoopbackSession;
    use bytes::Bytes;
    use std::time::Duration;

    const RAW_SIZE: usize = 4 * 2 * 3 / 2;

    struct Harness {
        stream: Stream,
        session: Arc<LoopbackSession>,
        headset: Arc<DesktopHeadset>,
    }

    fn harness(config: StreamConfig) -> Harness {
        let session = Arc::new(LoopbackSession::new());
        let headset = Arc::new(DesktopHeadset::new(90.0));
        let stream = Stream::start(
            config,
            session.clone(),
            headset.clone(),
            Arc::new(ClockedBackend::default()),
        )
        .unwrap();
        Harness {
            stream,
            session,
            headset,
        }
    }

    fn test_config() -> StreamConfig {
        StreamConfig {
            receive_poll_interval_ms: 5,
            tracking_interval_ms: 1000,
            audio_stop_timeout_ms: 200,
            ..Default::default()
        }
    }

    fn raw_layout(items: usize) -> ToHeadset {
        ToHeadset::VideoStreamDescription(VideoStreamDescription {
            width: 8,
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
        })
    }

    /// Frame `frame` of sub-stream `stream`, split in two shards
    fn frame_shards(stream: u8, frame: u64) -> [ToHeadset; 2] {
        let half = RAW_SIZE / 2;
        let shard = |idx: u32, is_last: bool| {
            ToHeadset::VideoShard(VideoShard {
                stream_item_idx: stream,
                frame_idx: frame,
                shard_idx: idx,
                shard_count_known: true,
                is_last,
                view_info: None,
                timing_info: (idx == 0).then(|| server_timing(frame)),
                payload: Bytes::from(vec![frame as u8; half]),
            })
        };
        [shard(1, true), shard(0, false)]
    }

    fn server_timing(frame: u64) -> TimingInfo {
        let base = frame as i64 * 1_000;
        TimingInfo {
            encode_begin: base,
            encode_end: base + 1,
            send_begin: base + 2,
            send_end: base + 3,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn render_until_frame(stream: &Stream, frame_id: u64) -> RenderOutcome {
        let mut outcome = None;
        assert!(wait_until(|| {
            let result = stream.render(Instant::now()).unwrap();
            let done = result.frame.as_ref().is_some_and(|f| f.frame_id == frame_id);
            outcome = Some(result);
            done
        }));
        outcome.unwrap()
    }

    #[test]
    fn test_advertises_headset_info_on_start() {
        let h = harness(test_config());
        let sent = h.session.take_sent();
        assert!(matches!(
            sent.first(),
            Some(FromHeadset::HeadsetInfo(info)) if info.refresh_rate == 90.0
        ));
        assert_eq!(h.stream.current_state(), StreamState::Initializing);
        let health = h.stream.health();
        assert!(health.packets_sent.load(Ordering::Relaxed) >= 1);
        assert!(health.bytes_sent.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_composes_common_frame() {
        let h = harness(test_config());
        h.session.inject(raw_layout(2));
        for frame in 1..=3 {
            for stream in 0..2 {
                for packet in frame_shards(stream, frame) {
                    h.session.inject(packet);
                }
            }
        }

        let outcome = render_until_frame(&h.stream, 3);
        let frame = outcome.frame.unwrap();
        assert!(frame.is_new);
        assert_eq!(frame.handles.len(), 2);
        assert_eq!(frame.handles[0].stream_index, 0);
        assert_eq!(frame.handles[1].stream_index, 1);
        assert_eq!(frame.handles[0].image.data, vec![3u8; RAW_SIZE]);
        assert_eq!(outcome.state, StreamState::Streaming);

        // Same frame again: shown, but not new and not re-reported
        let again = h.stream.render(Instant::now()).unwrap().frame.unwrap();
        assert_eq!(again.frame_id, 3);
        assert!(!again.is_new);

        let feedback: Vec<_> = h
            .session
            .take_sent()
            .into_iter()
            .filter_map(|p| match p {
                FromHeadset::Feedback(f) if f.frame_index == 3 => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(feedback.len(), 2);
        assert!(feedback.iter().all(|f| f.times_displayed == 1));
        assert!(feedback.iter().all(|f| f.displayed >= f.received_first_packet));
        assert!(feedback.iter().all(|f| f.server_timing == Some(server_timing(3))));
        assert_eq!(frame.handles[1].timestamps.server, Some(server_timing(3)));
    }

    #[test]
    fn test_no_common_frame_keeps_last() {
        let h = harness(test_config());
        h.session.inject(raw_layout(2));
        for packet in frame_shards(0, 5) {
            h.session.inject(packet);
        }
        for packet in frame_shards(1, 6) {
            h.session.inject(packet);
        }
        assert!(wait_until(|| h.stream.health().frames_decoded.load(Ordering::Relaxed) == 2));

        let outcome = h.stream.render(Instant::now()).unwrap();
        assert!(outcome.frame.is_none());
        assert_eq!(outcome.state, StreamState::Initializing);
        assert!(h.stream.health().common_frame_misses.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_stalls_and_recovers() {
        let config = StreamConfig {
            stall_multiplier: 2.0,
            ..test_config()
        };
        let h = harness(config);
        h.session.inject(raw_layout(1));
        for packet in frame_shards(0, 1) {
            h.session.inject(packet);
        }
        let t0 = Instant::now();
        render_until_frame(&h.stream, 1);

        // 90 fps, two intervals ≈ 22ms without a new frame
        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(h.stream.render(later).unwrap().state, StreamState::Stalled);

        for packet in frame_shards(0, 2) {
            h.session.inject(packet);
        }
        assert!(wait_until(|| {
            h.stream.render(later + t0.elapsed()).unwrap().state == StreamState::Streaming
        }));
    }

    #[test]
    fn test_degenerate_layout_fps_is_clamped() {
        let h = harness(test_config());
        let ToHeadset::VideoStreamDescription(mut description) = raw_layout(1) else {
            unreachable!()
        };
        description.fps = 1e-30;
        h.session.inject(ToHeadset::VideoStreamDescription(description));
        for packet in frame_shards(0, 1) {
            h.session.inject(packet);
        }

        render_until_frame(&h.stream, 1);
        assert_eq!(h.stream.shared.frame_rate(), crate::assets::MIN_FRAME_RATE);
        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(h.stream.render(later).unwrap().state, StreamState::Streaming);

        let ToHeadset::VideoStreamDescription(mut description) = raw_layout(1) else {
            unreachable!()
        };
        description.fps = f32::NAN;
        h.session.inject(ToHeadset::VideoStreamDescription(description));
        assert!(wait_until(|| h.stream.shared.lock_decoders().generation >= 2));
        assert_eq!(h.stream.shared.frame_rate(), crate::assets::MIN_FRAME_RATE);
    }

    #[test]
    fn test_new_layout_replaces_accumulators() {
        let h = harness(test_config());
        h.session.inject(raw_layout(1));
        for packet in frame_shards(0, 10) {
            h.session.inject(packet);
        }
        render_until_frame(&h.stream, 10);

        h.session.inject(raw_layout(2));
        for stream in 0..2 {
            for packet in frame_shards(stream, 1) {
                h.session.inject(packet);
            }
        }
        let frame = render_until_frame(&h.stream, 1).frame.unwrap();
        assert_eq!(frame.handles.len(), 2);
    }

    #[test]
    fn test_timesync_handshake_and_haptics() {
        let h = harness(test_config());
        h.session.take_sent();

        h.session.inject(ToHeadset::Handshake(Handshake {
            protocol_version: 1,
        }));
        h.session
            .inject(ToHeadset::TimesyncQuery(TimesyncQuery { query: 42 }));
        h.session.inject(ToHeadset::Haptics(Haptics {
            device: HapticsDevice::RightController,
            duration_ns: 5_000_000,
            frequency: 200.0,
            amplitude: 1.0,
        }));

        assert!(wait_until(|| h.headset.haptics_applied() == 1));
        let mut sent = Vec::new();
        assert!(wait_until(|| {
            sent.extend(h.session.take_sent());
            sent.iter()
                .any(|p| matches!(p, FromHeadset::TimesyncResponse(r) if r.query == 42))
        }));
        assert!(sent.iter().any(|p| matches!(p, FromHeadset::HeadsetInfo(_))));
    }

    #[test]
    fn test_audio_round_trip() {
        let config = StreamConfig {
            enable_microphone: true,
            ..test_config()
        };
        let h = harness(config);
        h.session
            .inject(ToHeadset::AudioStreamDescription(AudioStreamDescription {
                speaker: Some(AudioFormat::default()),
                microphone: Some(AudioFormat::default()),
            }));
        h.session.inject(ToHeadset::AudioData(AudioData {
            timestamp: 0,
            samples: vec![1; 960],
        }));

        // The clocked microphone produces silence every period
        let mut sent = Vec::new();
        assert!(wait_until(|| {
            sent.extend(h.session.take_sent());
            sent.iter().any(|p| matches!(p, FromHeadset::AudioData(_)))
        }));
    }

    #[test]
    fn test_decoder_failure_is_fatal() {
        let session = Arc::new(LoopbackSession::new());
        let failing: DecoderFactory = Arc::new(|_, _| Err(anyhow!("no hardware decoder")));
        let stream = Stream::start_with_decoders(
            test_config(),
            session.clone(),
            Arc::new(DesktopHeadset::default()),
            Arc::new(ClockedBackend::default()),
            failing,
        )
        .unwrap();

        session.inject(raw_layout(1));
        assert!(wait_until(|| !stream.alive()));
        assert!(stream.render(Instant::now()).is_err());
        let err = stream.take_error().unwrap();
        assert!(format!("{:#}", err).contains("no hardware decoder"));
        assert!(stream.take_error().is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut h = harness(test_config());
        h.session.inject(raw_layout(1));
        h.session
            .inject(ToHeadset::AudioStreamDescription(AudioStreamDescription {
                speaker: Some(AudioFormat::default()),
                microphone: None,
            }));
        thread::sleep(Duration::from_millis(20));

        h.stream.stop();
        assert!(!h.stream.alive());
        h.stream.stop();
        assert!(h.stream.shared.lock_audio().is_none());
        assert!(h.stream.shared.lock_decoders().accumulators.is_empty());
    }
}
