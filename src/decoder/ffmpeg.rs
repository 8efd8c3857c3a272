use super::{DecodedFrame, VideoDecoder, VideoFrame};
use crate::net::packets::VideoCodec;
use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::codec::video::VideoDecoder as AvVideoDecoder;
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use anyhow::{Result, anyhow};

/// Frame ids travel through the decoder as packet timestamps
const ID_TIME_BASE: TimeBase = TimeBase::new(1, 1);

/// H.264 / H.265 decoder using FFmpeg.
///
/// Output is packed YUV420p with stride padding stripped. The decoder may
/// hold frames back for reordering, so the id of each output image is read
/// back from its PTS rather than assumed to match the input.
pub struct FfmpegDecoder {
    decoder: AvVideoDecoder,
    codec: VideoCodec,
}

unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn new(codec: VideoCodec) -> Result<Self> {
        let name = match codec {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "hevc",
            VideoCodec::Raw => return Err(anyhow!("raw streams do not use FFmpeg")),
        };

        let decoder = AvVideoDecoder::builder(name)
            .map_err(|e| anyhow!("{} decoder unavailable: {}", codec, e))?
            .time_base(ID_TIME_BASE)
            .build()
            .map_err(|e| anyhow!("failed to open {} decoder: {}", codec, e))?;

        log::info!("FfmpegDecoder: opened {} decoder", codec);
        Ok(Self { decoder, codec })
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn decode(&mut self, frame_id: u64, data: &[u8]) -> Result<Vec<DecodedFrame>> {
        let packet = PacketMut::from(data)
            .with_pts(Timestamp::new(frame_id as i64, ID_TIME_BASE))
            .freeze();

        self.decoder
            .try_push(packet)
            .map_err(|e| anyhow!("{} decoder rejected frame {}: {}", self.codec, frame_id, e))?;

        let mut decoded = Vec::new();
        while let Some(frame) = self
            .decoder
            .take()
            .map_err(|e| anyhow!("{} decoder failed on frame {}: {}", self.codec, frame_id, e))?
        {
            let (w, h) = (frame.width(), frame.height());
            let planes = frame.planes();
            let (uw, uh) = (w / 2, h / 2);

            let mut packed = vec![0u8; w * h + uw * uh * 2];
            let (y, chroma) = packed.split_at_mut(w * h);
            let (u, v) = chroma.split_at_mut(uw * uh);
            copy_plane(y, planes[0].data(), planes[0].line_size(), w, h);
            copy_plane(u, planes[1].data(), planes[1].line_size(), uw, uh);
            copy_plane(v, planes[2].data(), planes[2].line_size(), uw, uh);

            let id = frame.pts().timestamp();
            decoded.push(DecodedFrame {
                frame_id: if id >= 0 { id as u64 } else { frame_id },
                image: VideoFrame {
                    data: packed,
                    width: w as u32,
                    height: h as u32,
                },
            });
        }

        Ok(decoded)
    }
}

/// Copy a padded plane into a contiguous destination
#[inline]
fn copy_plane(dst: &mut [u8], src: &[u8], stride: usize, width: usize, height: usize) {
    if stride == width && src.len() >= width * height {
        dst.copy_from_slice(&src[..width * height]);
        return;
    }

    for (row, out) in dst.chunks_exact_mut(width).take(height).enumerate() {
        let start = row * stride;
        if start + width > src.len() {
            break;
        }
        out.copy_from_slice(&src[start..start + width]);
    }
}
