//! Video decoding: shard reassembly and the decoder seam
//!
//! Each sub-stream of the video layout owns one [`ShardAccumulator`] wrapping
//! one [`VideoDecoder`]. Decoders are created through a [`DecoderFactory`] so
//! the stream controller does not need to know which codecs are compiled in.

pub mod accumulator;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod raw;

use crate::net::packets::{VideoCodec, VideoStreamItem};
use anyhow::Result;
use std::sync::Arc;

pub use accumulator::{ShardAccumulator, ShardOutcome};
pub use raw::RawDecoder;

/// Decoded video frame with raw pixel data.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Output of a decoder, tagged with the frame id it was decoded from
#[derive(Debug)]
pub struct DecodedFrame {
    pub frame_id: u64,
    pub image: VideoFrame,
}

/// One sub-stream's decoder.
///
/// `decode` receives a complete access unit and returns every image the
/// decoder produced in response, which may lag behind the input (or be empty
/// while it buffers). An error means the access unit is skipped; the decoder
/// stays usable for the next one.
pub trait VideoDecoder: Send {
    fn decode(&mut self, frame_id: u64, data: &[u8]) -> Result<Vec<DecodedFrame>>;
}

/// Builds the decoder for sub-stream `index` of a new layout.
/// A failure here is fatal for the stream.
pub type DecoderFactory =
    Arc<dyn Fn(u8, &VideoStreamItem) -> Result<Box<dyn VideoDecoder>> + Send + Sync>;

/// Decoders available in this build
pub fn default_decoder_factory() -> DecoderFactory {
    Arc::new(|_index, item| create_decoder(item))
}

pub fn create_decoder(item: &VideoStreamItem) -> Result<Box<dyn VideoDecoder>> {
    match item.codec {
        VideoCodec::Raw => Ok(Box::new(RawDecoder::new(
            item.width as u32,
            item.height as u32,
        ))),
        #[cfg(feature = "ffmpeg")]
        VideoCodec::H264 | VideoCodec::H265 => Ok(Box::new(ffmpeg::FfmpegDecoder::new(item.codec)?)),
        #[cfg(not(feature = "ffmpeg"))]
        codec => Err(anyhow::anyhow!(
            "no {} decoder in this build (enable the `ffmpeg` feature)",
            codec
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_decoder_is_always_available() {
        let item = VideoStreamItem {
            codec: VideoCodec::Raw,
            width: 4,
            height: 2,
            offset_x: 0,
            offset_y: 0,
        };
        let mut decoder = create_decoder(&item).unwrap();
        let frames = decoder.decode(1, &[0u8; 12]).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_compressed_codec_needs_ffmpeg() {
        let item = VideoStreamItem {
            codec: VideoCodec::H265,
            width: 1920,
            height: 1920,
            offset_x: 0,
            offset_y: 0,
        };
        assert!(create_decoder(&item).is_err());
    }
}
