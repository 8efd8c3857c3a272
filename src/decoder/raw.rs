use super::{DecodedFrame, VideoDecoder, VideoFrame};
use anyhow::{Result, bail};

/// Pass-through decoder for uncompressed sub-streams.
///
/// The access unit is a packed YUV420p image: Y plane (w*h) followed by the
/// U and V planes (w/2 * h/2 each). Output is produced synchronously.
pub struct RawDecoder {
    width: u32,
    height: u32,
    frame_size: usize,
}

impl RawDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        Self {
            width,
            height,
            frame_size: w * h + (w / 2) * (h / 2) * 2,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl VideoDecoder for RawDecoder {
    fn decode(&mut self, frame_id: u64, data: &[u8]) -> Result<Vec<DecodedFrame>> {
        if data.len() != self.frame_size {
            bail!(
                "raw frame {} is {} bytes, expected {} for {}x{}",
                frame_id,
                data.len(),
                self.frame_size,
                self.width,
                self.height
            );
        }

        Ok(vec![DecodedFrame {
            frame_id,
            image: VideoFrame {
                data: data.to_vec(),
                width: self.width,
                height: self.height,
            },
        }])
    }
}
