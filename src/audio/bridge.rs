//! Bridge between network audio packets and the hardware callbacks
//!
//! Neither callback ever blocks: the speaker side pops from a lock-free ring
//! and pads with silence, the microphone side pushes into one and drops when
//! it is full.

use crate::audio::backend::{AudioBackend, HardwareStream};
use crate::audio::gate::{CallbackResult, StopGate};
use crate::config::StreamConfig;
use crate::net::packets::{AudioData, AudioDescription, AudioFormat};
use crate::pipeline::clock::StreamClock;
use crate::pipeline::health::StreamHealth;
use anyhow::{Context, Result};
use crossbeam::queue::ArrayQueue;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Speaker frame partially consumed by the previous callback
struct PartialFrame {
    samples: Vec<i16>,
    offset: usize,
}

pub struct SpeakerPath {
    ring: ArrayQueue<AudioData>,
    /// Only the callback takes this lock, and only with `try_lock`
    partial: Mutex<Option<PartialFrame>>,
    gate: StopGate,
    health: Arc<StreamHealth>,
}

impl SpeakerPath {
    fn new(capacity: usize, health: Arc<StreamHealth>) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            partial: Mutex::new(None),
            gate: StopGate::new(),
            health,
        }
    }

    /// Hardware callback: fill `out` with exactly `out.len()` samples
    pub fn fill(&self, out: &mut [i16]) -> CallbackResult {
        let Some(_running) = self.gate.enter() else {
            out.fill(0);
            return CallbackResult::Stop;
        };
        let Ok(mut partial) = self.partial.try_lock() else {
            out.fill(0);
            self.health.record_speaker_underflow();
            return CallbackResult::Continue;
        };

        let mut written = 0;
        while written < out.len() {
            if partial.is_none() {
                match self.ring.pop() {
                    Some(frame) => {
                        *partial = Some(PartialFrame {
                            samples: frame.samples,
                            offset: 0,
                        })
                    }
                    None => break,
                }
            }
            let Some(frame) = partial.as_mut() else {
                break;
            };

            let n = (out.len() - written).min(frame.samples.len() - frame.offset);
            out[written..written + n]
                .copy_from_slice(&frame.samples[frame.offset..frame.offset + n]);
            frame.offset += n;
            written += n;

            if frame.offset == frame.samples.len() {
                *partial = None;
            }
        }

        if written < out.len() {
            out[written..].fill(0);
            self.health.record_speaker_underflow();
        }
        CallbackResult::Continue
    }

    fn release(&self) {
        while self.ring.pop().is_some() {}
        if let Ok(mut partial) = self.partial.lock() {
            *partial = None;
        }
    }
}

pub struct MicrophonePath {
    ring: ArrayQueue<AudioData>,
    gate: StopGate,
    health: Arc<StreamHealth>,
    clock: StreamClock,
}

impl MicrophonePath {
    fn new(capacity: usize, health: Arc<StreamHealth>, clock: StreamClock) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            gate: StopGate::new(),
            health,
            clock,
        }
    }

    /// Hardware callback: keep a copy of the captured samples
    pub fn capture(&self, input: &[i16]) -> CallbackResult {
        let Some(_running) = self.gate.enter() else {
            return CallbackResult::Stop;
        };

        let data = AudioData {
            timestamp: self.clock.now().nanos,
            samples: input.to_vec(),
        };
        if self.ring.push(data).is_err() {
            self.health.record_microphone_overflow();
        }
        CallbackResult::Continue
    }

    fn release(&self) {
        while self.ring.pop().is_some() {}
    }
}

/// Audio side of a stream: rings, gates and the open hardware streams
pub struct AudioBridge {
    description: AudioDescription,
    speaker: Arc<SpeakerPath>,
    microphone: Option<Arc<MicrophonePath>>,
    speaker_stream: Option<Box<dyn HardwareStream>>,
    microphone_stream: Option<Box<dyn HardwareStream>>,
    stop_timeout: Duration,
    closed: bool,
}

impl AudioBridge {
    /// Rings and gates only; no hardware attached
    pub fn new(
        description: AudioDescription,
        config: &StreamConfig,
        health: Arc<StreamHealth>,
        clock: StreamClock,
    ) -> Self {
        let microphone = description.microphone.map(|_| {
            Arc::new(MicrophonePath::new(
                config.microphone_ring_capacity,
                health.clone(),
                clock.clone(),
            ))
        });

        Self {
            description,
            speaker: Arc::new(SpeakerPath::new(config.speaker_ring_capacity, health)),
            microphone,
            speaker_stream: None,
            microphone_stream: None,
            stop_timeout: config.audio_stop_timeout(),
            closed: false,
        }
    }

    /// Create the bridge and open its device streams on `backend`.
    /// Failing to open a stream is fatal for the caller.
    pub fn start(
        backend: &dyn AudioBackend,
        description: AudioDescription,
        config: &StreamConfig,
        health: Arc<StreamHealth>,
        clock: StreamClock,
    ) -> Result<Self> {
        let mut bridge = Self::new(description, config, health, clock);

        let speaker = bridge.speaker.clone();
        let mut stream = backend
            .open_speaker(
                description.speaker,
                Box::new(move |out: &mut [i16]| speaker.fill(out)),
            )
            .context("Failed to open speaker stream")?;
        stream.start().context("Failed to start speaker stream")?;
        bridge.speaker_stream = Some(stream);

        if let (Some(format), Some(microphone)) = (description.microphone, bridge.microphone.clone())
        {
            let mut stream = backend
                .open_microphone(
                    format,
                    Box::new(move |input: &[i16]| microphone.capture(input)),
                )
                .context("Failed to open microphone stream")?;
            stream.start().context("Failed to start microphone stream")?;
            bridge.microphone_stream = Some(stream);
        }

        info!(
            "AudioBridge: started (speaker {} Hz x{}, microphone {})",
            description.speaker.sample_rate,
            description.speaker.num_channels,
            match description.microphone {
                Some(m) => format!("{} Hz x{}", m.sample_rate, m.num_channels),
                None => "off".to_string(),
            }
        );
        Ok(bridge)
    }

    pub fn description(&self) -> AudioDescription {
        self.description
    }

    pub fn speaker(&self) -> Arc<SpeakerPath> {
        self.speaker.clone()
    }

    pub fn microphone(&self) -> Option<Arc<MicrophonePath>> {
        self.microphone.clone()
    }

    /// Queue a speaker frame from the network; dropped if the ring is full
    pub fn push_speaker(&self, data: AudioData) {
        if self.closed || self.speaker.ring.push(data).is_err() {
            self.speaker.health.record_speaker_overflow();
        }
    }

    /// Captured microphone frames, oldest first
    pub fn drain_microphone(&self) -> Vec<AudioData> {
        let Some(microphone) = &self.microphone else {
            return Vec::new();
        };
        let mut frames = Vec::with_capacity(microphone.ring.len());
        while let Some(frame) = microphone.ring.pop() {
            frames.push(frame);
        }
        frames
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop both directions and release the hardware. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.speaker.gate.request_stop();
        if let Some(microphone) = &self.microphone {
            microphone.gate.request_stop();
        }

        // A gate no callback ever entered has nothing to acknowledge
        if self.speaker_stream.is_some() || self.speaker.gate.has_run() {
            self.speaker.gate.wait_stopped("AudioBridge speaker", self.stop_timeout);
        }
        if let Some(microphone) = &self.microphone {
            if self.microphone_stream.is_some() || microphone.gate.has_run() {
                microphone
                    .gate
                    .wait_stopped("AudioBridge microphone", self.stop_timeout);
            }
        }

        debug_assert_eq!(self.speaker.gate.running(), 0);
        if let Some(mut stream) = self.speaker_stream.take() {
            stream.close();
        }
        if let Some(mut stream) = self.microphone_stream.take() {
            stream.close();
        }

        self.speaker.release();
        if let Some(microphone) = &self.microphone {
            microphone.release();
        }
        info!("AudioBridge: finished");
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// Audio formats to advertise to the server.
///
/// Never fails: a missing output device falls back to the default format, a
/// missing input device disables the microphone.
pub fn get_audio_description(backend: &dyn AudioBackend, enable_microphone: bool) -> AudioDescription {
    let speaker = backend.speaker_format().unwrap_or_else(|| {
        warn!("No output audio device, advertising the default format");
        AudioFormat::default()
    });

    let microphone = if enable_microphone {
        let format = backend.microphone_format();
        if format.is_none() {
            warn!("No input audio device, microphone disabled");
        }
        format
    } else {
        None
    };

    AudioDescription { speaker, microphone }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::clocked::ClockedBackend;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn description(microphone: bool) -> AudioDescription {
        AudioDescription {
            speaker: AudioFormat::default(),
            microphone: microphone.then(AudioFormat::default),
        }
    }

    fn bridge(microphone: bool) -> (AudioBridge, Arc<StreamHealth>) {
        let health = Arc::new(StreamHealth::new());
        let config = StreamConfig {
            speaker_ring_capacity: 4,
            microphone_ring_capacity: 2,
            ..Default::default()
        };
        let bridge = AudioBridge::new(
            description(microphone),
            &config,
            health.clone(),
            StreamClock::new(),
        );
        (bridge, health)
    }

    fn frame(samples: &[i16]) -> AudioData {
        AudioData {
            timestamp: 0,
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn test_partial_frame_carries_over() {
        let (bridge, health) = bridge(false);
        bridge.push_speaker(frame(&[1, 2, 3, 4, 5]));
        bridge.push_speaker(frame(&[6, 7]));

        let speaker = bridge.speaker();
        let mut out = [0i16; 3];
        assert_eq!(speaker.fill(&mut out), CallbackResult::Continue);
        assert_eq!(out, [1, 2, 3]);
        speaker.fill(&mut out);
        assert_eq!(out, [4, 5, 6]);

        // Underflow pads with silence
        speaker.fill(&mut out);
        assert_eq!(out, [7, 0, 0]);
        assert_eq!(health.speaker_underflows.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_speaker_overflow_drops() {
        let (bridge, health) = bridge(false);
        for i in 0..6 {
            bridge.push_speaker(frame(&[i]));
        }
        assert_eq!(health.speaker_overflows.load(Ordering::Relaxed), 2);

        let mut out = [0i16; 4];
        bridge.speaker().fill(&mut out);
        assert_eq!(out, [0, 1, 2, 3]);
    }

    #[test]
    fn test_microphone_capture_and_drain() {
        let (bridge, health) = bridge(true);
        let microphone = bridge.microphone().unwrap();
        microphone.capture(&[1, 2]);
        microphone.capture(&[3, 4]);
        microphone.capture(&[5, 6]);

        let drained = bridge.drain_microphone();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].samples, vec![1, 2]);
        assert!(drained[1].timestamp >= drained[0].timestamp);
        assert_eq!(health.microphone_overflows.load(Ordering::Relaxed), 1);
        assert!(bridge.drain_microphone().is_empty());
    }

    #[test]
    fn test_no_microphone_path_when_disabled() {
        let (bridge, _) = bridge(false);
        assert!(bridge.microphone().is_none());
        assert!(bridge.drain_microphone().is_empty());
    }

    #[test]
    fn test_callback_after_stop_request() {
        let (mut bridge, _) = bridge(true);
        let speaker = bridge.speaker();
        let microphone = bridge.microphone().unwrap();
        bridge.push_speaker(frame(&[9, 9]));

        bridge.close();

        let mut out = [1i16; 2];
        assert_eq!(speaker.fill(&mut out), CallbackResult::Stop);
        assert_eq!(out, [0, 0]);
        assert_eq!(microphone.capture(&[1]), CallbackResult::Stop);
        assert!(bridge.is_closed());
    }

    #[test]
    fn test_clocked_streams_stop_cleanly() {
        let health = Arc::new(StreamHealth::new());
        let backend = ClockedBackend::new(AudioFormat::default(), Some(AudioFormat::default()));
        let mut bridge = AudioBridge::start(
            &backend,
            description(true),
            &StreamConfig::default(),
            health.clone(),
            StreamClock::new(),
        )
        .unwrap();

        for _ in 0..10 {
            bridge.push_speaker(frame(&[100; 480]));
        }
        thread::sleep(Duration::from_millis(50));
        assert!(!bridge.drain_microphone().is_empty());

        bridge.close();
        assert!(bridge.speaker.gate.acknowledged());
        assert!(bridge.drain_microphone().is_empty());
    }

    #[test]
    fn test_stress_concurrent_callbacks_during_shutdown() {
        for _ in 0..20 {
            let (mut bridge, _) = bridge(true);
            let speaker = bridge.speaker();
            let microphone = bridge.microphone().unwrap();
            let started = Arc::new(AtomicBool::new(false));

            let mut callbacks = Vec::new();
            for t in 0..4 {
                let speaker = speaker.clone();
                let microphone = microphone.clone();
                let started = started.clone();
                callbacks.push(thread::spawn(move || {
                    let mut out = [0i16; 64];
                    let mut saw_stop = false;
                    let deadline = std::time::Instant::now() + Duration::from_secs(10);
                    while std::time::Instant::now() < deadline {
                        started.store(true, Ordering::SeqCst);
                        let result = if t % 2 == 0 {
                            speaker.fill(&mut out)
                        } else {
                            microphone.capture(&out)
                        };
                        if result == CallbackResult::Stop {
                            saw_stop = true;
                            break;
                        }
                    }
                    saw_stop
                }));
            }

            for i in 0..50 {
                bridge.push_speaker(frame(&[i; 32]));
                let _ = bridge.drain_microphone();
            }
            while !started.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            bridge.close();

            // Every invocation past the gate finished before the rings were
            // released, so nothing can land in them afterwards
            assert_eq!(speaker.gate.running(), 0);
            assert_eq!(microphone.gate.running(), 0);

            for callback in callbacks {
                assert!(callback.join().unwrap());
            }
            assert!(microphone.ring.is_empty());
            assert!(speaker.ring.is_empty());
            assert!(speaker.partial.lock().unwrap().is_none());
        }
    }

    struct NoDevices;

    impl AudioBackend for NoDevices {
        fn speaker_format(&self) -> Option<AudioFormat> {
            None
        }
        fn microphone_format(&self) -> Option<AudioFormat> {
            None
        }
        fn open_speaker(
            &self,
            _format: AudioFormat,
            _callback: crate::audio::backend::SpeakerCallback,
        ) -> Result<Box<dyn HardwareStream>> {
            Err(anyhow::anyhow!("no output device"))
        }
        fn open_microphone(
            &self,
            _format: AudioFormat,
            _callback: crate::audio::backend::MicrophoneCallback,
        ) -> Result<Box<dyn HardwareStream>> {
            Err(anyhow::anyhow!("no input device"))
        }
    }

    #[test]
    fn test_audio_description_fallbacks() {
        let description = get_audio_description(&NoDevices, true);
        assert_eq!(description.speaker, AudioFormat::default());
        assert!(!description.microphone_enabled());

        let backend = ClockedBackend::new(
            AudioFormat {
                sample_rate: 44_100,
                num_channels: 1,
            },
            Some(AudioFormat::default()),
        );
        let description = get_audio_description(&backend, false);
        assert_eq!(description.speaker.sample_rate, 44_100);
        assert!(description.microphone.is_none());
        assert!(get_audio_description(&backend, true).microphone_enabled());
    }

    #[test]
    fn test_start_fails_without_device() {
        let result = AudioBridge::start(
            &NoDevices,
            description(false),
            &StreamConfig::default(),
            Arc::new(StreamHealth::new()),
            StreamClock::new(),
        );
        assert!(result.is_err());
    }
}
