//! Headset-side receiving engine for remotely rendered XR streams.
//!
//! A [`Stream`] connects to a rendering server through a [`net::Session`],
//! reassembles the video shards of every sub-stream, decodes them, and hands
//! the most recent frame all sub-streams agree on to the caller's render
//! loop. Audio flows both ways through an [`audio::AudioBridge`].

pub mod assets;
pub mod audio;
pub mod config;
pub mod decoder;
pub mod display;
pub mod headset;
pub mod net;
pub mod pipeline;
pub mod utils;

pub use config::StreamConfig;
pub use pipeline::{RenderOutcome, Stream, StreamState};
