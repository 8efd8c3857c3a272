//! Software-clocked audio backend
//!
//! Drives the callbacks from a plain thread at the cadence a device with the
//! same buffer period would. Speaker output is discarded and the microphone
//! captures silence; used for headless runs and tests.

use crate::audio::backend::{AudioBackend, HardwareStream, MicrophoneCallback, SpeakerCallback};
use crate::audio::gate::CallbackResult;
use crate::net::packets::AudioFormat;
use crate::utils::sos::SignalOfStop;
use anyhow::{Result, anyhow};
use log::{debug, info};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DEFAULT_PERIOD: Duration = Duration::from_millis(10);

pub struct ClockedBackend {
    speaker: AudioFormat,
    microphone: Option<AudioFormat>,
    period: Duration,
}

impl ClockedBackend {
    pub fn new(speaker: AudioFormat, microphone: Option<AudioFormat>) -> Self {
        Self {
            speaker,
            microphone,
            period: DEFAULT_PERIOD,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_millis(1));
        self
    }
}

impl Default for ClockedBackend {
    fn default() -> Self {
        Self::new(AudioFormat::default(), Some(AudioFormat::default()))
    }
}

impl AudioBackend for ClockedBackend {
    fn speaker_format(&self) -> Option<AudioFormat> {
        Some(self.speaker)
    }

    fn microphone_format(&self) -> Option<AudioFormat> {
        self.microphone
    }

    fn open_speaker(
        &self,
        format: AudioFormat,
        callback: SpeakerCallback,
    ) -> Result<Box<dyn HardwareStream>> {
        Ok(Box::new(ClockedStream::new(
            "speaker",
            format,
            self.period,
            Callback::Speaker(callback),
        )))
    }

    fn open_microphone(
        &self,
        format: AudioFormat,
        callback: MicrophoneCallback,
    ) -> Result<Box<dyn HardwareStream>> {
        if self.microphone.is_none() {
            return Err(anyhow!("no input device"));
        }
        Ok(Box::new(ClockedStream::new(
            "microphone",
            format,
            self.period,
            Callback::Microphone(callback),
        )))
    }
}

enum Callback {
    Speaker(SpeakerCallback),
    Microphone(MicrophoneCallback),
}

struct ClockedStream {
    name: &'static str,
    period: Duration,
    buffer_len: usize,
    callback: Option<Callback>,
    sos: SignalOfStop,
    handle: Option<JoinHandle<u64>>,
}

impl ClockedStream {
    fn new(name: &'static str, format: AudioFormat, period: Duration, callback: Callback) -> Self {
        let frames = (format.sample_rate as u128 * period.as_micros() / 1_000_000) as usize;
        Self {
            name,
            period,
            buffer_len: frames.max(1) * format.num_channels.max(1) as usize,
            callback: Some(callback),
            sos: SignalOfStop::new(),
            handle: None,
        }
    }
}

impl HardwareStream for ClockedStream {
    fn start(&mut self) -> Result<()> {
        let mut callback = self
            .callback
            .take()
            .ok_or_else(|| anyhow!("{} stream already started", self.name))?;
        let sos = self.sos.clone();
        let period = self.period;
        let mut buffer = vec![0i16; self.buffer_len];
        let name = self.name;

        let handle = thread::Builder::new()
            .name(format!("clocked-{}", name))
            .spawn(move || {
                let mut invocations = 0u64;
                while !sos.wait_timeout(period) {
                    invocations += 1;
                    let result = match &mut callback {
                        Callback::Speaker(fill) => fill(buffer.as_mut_slice()),
                        Callback::Microphone(capture) => {
                            buffer.fill(0);
                            capture(buffer.as_slice())
                        }
                    };
                    if result == CallbackResult::Stop {
                        debug!("ClockedStream[{}]: callback requested stop", name);
                        break;
                    }
                }
                invocations
            })?;

        info!("ClockedStream[{}]: started ({} samples every {:?})", name, self.buffer_len, period);
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        self.sos.cancel();
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(invocations) => info!(
                    "ClockedStream[{}]: finished ({} callbacks)",
                    self.name, invocations
                ),
                Err(_) => log::error!("ClockedStream[{}]: callback thread panicked", self.name),
            }
        }
    }
}

impl Drop for ClockedStream {
    fn drop(&mut self) {
        self.close();
    }
}
