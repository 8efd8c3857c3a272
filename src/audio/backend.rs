//! Capability traits the audio bridge drives hardware through

use crate::audio::gate::CallbackResult;
use crate::net::packets::AudioFormat;
use anyhow::Result;

/// Fills an interleaved i16 output buffer; called on the backend's thread
pub type SpeakerCallback = Box<dyn FnMut(&mut [i16]) -> CallbackResult + Send>;

/// Consumes an interleaved i16 input buffer; called on the backend's thread
pub type MicrophoneCallback = Box<dyn FnMut(&[i16]) -> CallbackResult + Send>;

pub trait AudioBackend: Send + Sync {
    /// Native format of the default output device, if there is one
    fn speaker_format(&self) -> Option<AudioFormat>;

    /// Native format of the default input device, if there is one
    fn microphone_format(&self) -> Option<AudioFormat>;

    fn open_speaker(
        &self,
        format: AudioFormat,
        callback: SpeakerCallback,
    ) -> Result<Box<dyn HardwareStream>>;

    fn open_microphone(
        &self,
        format: AudioFormat,
        callback: MicrophoneCallback,
    ) -> Result<Box<dyn HardwareStream>>;
}

/// An opened device stream. `close` must not return while the backend can
/// still invoke the callback.
pub trait HardwareStream: Send {
    fn start(&mut self) -> Result<()>;
    fn close(&mut self);
}
