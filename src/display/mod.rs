//! Decoded frames handed to the renderer

pub mod frame_ring;

pub use frame_ring::{BlitHandle, FrameRing, FrameTimestamps};
