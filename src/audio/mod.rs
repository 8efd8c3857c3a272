//! Speaker and microphone plumbing between the network and audio devices

pub mod backend;
pub mod bridge;
pub mod clocked;
#[cfg(feature = "cpal")]
pub mod cpal_backend;
pub mod gate;

pub use backend::{AudioBackend, HardwareStream};
pub use bridge::{AudioBridge, get_audio_description};
pub use clocked::ClockedBackend;
pub use gate::CallbackResult;

/// Real devices when built with the `cpal` feature, otherwise the software clock
pub fn default_backend() -> Box<dyn AudioBackend> {
    #[cfg(feature = "cpal")]
    return Box::new(cpal_backend::CpalBackend::new());

    #[cfg(not(feature = "cpal"))]
    Box::new(ClockedBackend::default())
}
