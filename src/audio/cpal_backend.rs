//! Audio devices through cpal
//!
//! Streams are opened as f32 and converted to and from the bridge's
//! interleaved i16 samples inside the device callback.

use crate::audio::backend::{AudioBackend, HardwareStream, MicrophoneCallback, SpeakerCallback};
use crate::audio::gate::CallbackResult;
use crate::net::packets::AudioFormat;
use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info};

const I16_TO_F32: f32 = 1.0 / 32768.0;

pub struct CpalBackend {
    host: cpal::Host,
}

unsafe impl Send for CpalBackend {}
unsafe impl Sync for CpalBackend {}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn stream_config(format: AudioFormat) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: format.num_channels as u16,
        sample_rate: format.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    }
}

impl AudioBackend for CpalBackend {
    fn speaker_format(&self) -> Option<AudioFormat> {
        let config = self.host.default_output_device()?.default_output_config().ok()?;
        Some(AudioFormat {
            sample_rate: config.sample_rate(),
            num_channels: config.channels().min(u8::MAX as u16) as u8,
        })
    }

    fn microphone_format(&self) -> Option<AudioFormat> {
        let config = self.host.default_input_device()?.default_input_config().ok()?;
        Some(AudioFormat {
            sample_rate: config.sample_rate(),
            num_channels: config.channels().min(u8::MAX as u16) as u8,
        })
    }

    fn open_speaker(
        &self,
        format: AudioFormat,
        mut callback: SpeakerCallback,
    ) -> Result<Box<dyn HardwareStream>> {
        let device = self
            .host
            .default_output_device()
            .ok_or_else(|| anyhow!("No output audio device"))?;

        let mut scratch: Vec<i16> = Vec::new();
        let mut stopped = false;
        let stream = device.build_output_stream(
            &stream_config(format),
            move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if stopped {
                    output.fill(0.0);
                    return;
                }
                scratch.resize(output.len(), 0);
                stopped = callback(scratch.as_mut_slice()) == CallbackResult::Stop;
                for (out, &sample) in output.iter_mut().zip(scratch.iter()) {
                    *out = sample as f32 * I16_TO_F32;
                }
            },
            |err| error!("Audio output error: {}", err),
            None,
        )?;

        info!("CpalBackend: speaker stream opened ({} Hz x{})", format.sample_rate, format.num_channels);
        Ok(Box::new(CpalStream {
            stream: Some(stream),
        }))
    }

    fn open_microphone(
        &self,
        format: AudioFormat,
        mut callback: MicrophoneCallback,
    ) -> Result<Box<dyn HardwareStream>> {
        let device = self
            .host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input audio device"))?;

        let mut scratch: Vec<i16> = Vec::new();
        let mut stopped = false;
        let stream = device.build_input_stream(
            &stream_config(format),
            move |input: &[f32], _: &cpal::InputCallbackInfo| {
                if stopped {
                    return;
                }
                scratch.clear();
                scratch.extend(
                    input
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                );
                stopped = callback(scratch.as_slice()) == CallbackResult::Stop;
            },
            |err| error!("Audio input error: {}", err),
            None,
        )?;

        info!("CpalBackend: microphone stream opened ({} Hz x{})", format.sample_rate, format.num_channels);
        Ok(Box::new(CpalStream {
            stream: Some(stream),
        }))
    }
}

struct CpalStream {
    stream: Option<cpal::Stream>,
}

unsafe impl Send for CpalStream {}

impl HardwareStream for CpalStream {
    fn start(&mut self) -> Result<()> {
        match &self.stream {
            Some(stream) => Ok(stream.play()?),
            None => Err(anyhow!("stream already closed")),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                error!("Failed to pause audio stream: {}", e);
            }
            // Dropping the stream joins the backend's callback thread
            drop(stream);
        }
    }
}
