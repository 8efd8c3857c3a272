//! Little-endian datagram codec for [`ToHeadset`] and [`FromHeadset`]
//!
//! Every datagram starts with a one-byte packet tag. A video shard carries its
//! payload as the remainder of the datagram, after the envelope:
//!
//! ```text
//! tag | stream_item_idx u8 | frame_idx u64 | shard_idx u32 | flags u8
//!     | [view_info] | [timing_info] | payload...
//! ```

use crate::assets::VIEW_COUNT;
use crate::net::packets::*;
use anyhow::{Result, anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const SHARD_COUNT_KNOWN: u8 = 0x01;
const SHARD_LAST: u8 = 0x02;
const SHARD_VIEW_INFO: u8 = 0x04;
const SHARD_TIMING_INFO: u8 = 0x08;

pub trait Wire: Sized {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self>;
}

/// Serialize one packet into a datagram
pub fn encode_packet<T: Wire>(packet: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    packet.encode(&mut buf);
    buf.freeze()
}

/// Parse one datagram, rejecting truncated or oversized input
pub fn decode_packet<T: Wire>(mut datagram: Bytes) -> Result<T> {
    let packet = T::decode(&mut datagram)?;
    if datagram.has_remaining() {
        bail!("{} trailing bytes after packet", datagram.remaining());
    }
    Ok(packet)
}

#[inline]
fn need(buf: &Bytes, len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(anyhow!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        ));
    }
    Ok(())
}

fn put_pose(buf: &mut BytesMut, pose: &Pose) {
    for v in pose.orientation {
        buf.put_f32_le(v);
    }
    for v in pose.position {
        buf.put_f32_le(v);
    }
}

fn get_pose(buf: &mut Bytes) -> Result<Pose> {
    need(buf, 7 * 4, "pose")?;
    let mut pose = Pose::default();
    for v in pose.orientation.iter_mut() {
        *v = buf.get_f32_le();
    }
    for v in pose.position.iter_mut() {
        *v = buf.get_f32_le();
    }
    Ok(pose)
}

fn put_fov(buf: &mut BytesMut, fov: &Fov) {
    buf.put_f32_le(fov.angle_left);
    buf.put_f32_le(fov.angle_right);
    buf.put_f32_le(fov.angle_up);
    buf.put_f32_le(fov.angle_down);
}

fn get_fov(buf: &mut Bytes) -> Result<Fov> {
    need(buf, 4 * 4, "fov")?;
    Ok(Fov {
        angle_left: buf.get_f32_le(),
        angle_right: buf.get_f32_le(),
        angle_up: buf.get_f32_le(),
        angle_down: buf.get_f32_le(),
    })
}

fn put_view_info(buf: &mut BytesMut, info: &ViewInfo) {
    buf.put_i64_le(info.display_time);
    for pose in &info.pose {
        put_pose(buf, pose);
    }
    for fov in &info.fov {
        put_fov(buf, fov);
    }
}

fn get_view_info(buf: &mut Bytes) -> Result<ViewInfo> {
    need(buf, 8, "view info")?;
    let mut info = ViewInfo {
        display_time: buf.get_i64_le(),
        ..Default::default()
    };
    for i in 0..VIEW_COUNT {
        info.pose[i] = get_pose(buf)?;
    }
    for i in 0..VIEW_COUNT {
        info.fov[i] = get_fov(buf)?;
    }
    Ok(info)
}

fn put_timing_info(buf: &mut BytesMut, timing: &TimingInfo) {
    buf.put_i64_le(timing.encode_begin);
    buf.put_i64_le(timing.encode_end);
    buf.put_i64_le(timing.send_begin);
    buf.put_i64_le(timing.send_end);
}

fn get_timing_info(buf: &mut Bytes) -> Result<TimingInfo> {
    need(buf, 32, "timing info")?;
    Ok(TimingInfo {
        encode_begin: buf.get_i64_le(),
        encode_end: buf.get_i64_le(),
        send_begin: buf.get_i64_le(),
        send_end: buf.get_i64_le(),
    })
}

fn put_audio_format(buf: &mut BytesMut, format: Option<&AudioFormat>) {
    match format {
        Some(format) => {
            buf.put_u8(1);
            buf.put_u32_le(format.sample_rate);
            buf.put_u8(format.num_channels);
        }
        None => buf.put_u8(0),
    }
}

fn get_audio_format(buf: &mut Bytes) -> Result<Option<AudioFormat>> {
    need(buf, 1, "audio format")?;
    if buf.get_u8() == 0 {
        return Ok(None);
    }
    need(buf, 5, "audio format")?;
    Ok(Some(AudioFormat {
        sample_rate: buf.get_u32_le(),
        num_channels: buf.get_u8(),
    }))
}

impl Wire for AudioData {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.timestamp);
        buf.put_u32_le(self.samples.len() as u32);
        for &sample in &self.samples {
            buf.put_i16_le(sample);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        need(buf, 12, "audio data")?;
        let timestamp = buf.get_i64_le();
        let count = buf.get_u32_le() as usize;
        need(buf, count * 2, "audio samples")?;
        let samples = (0..count).map(|_| buf.get_i16_le()).collect();
        Ok(AudioData { timestamp, samples })
    }
}

impl Wire for VideoShard {
    fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.shard_count_known {
            flags |= SHARD_COUNT_KNOWN;
        }
        if self.is_last {
            flags |= SHARD_LAST;
        }
        if self.view_info.is_some() {
            flags |= SHARD_VIEW_INFO;
        }
        if self.timing_info.is_some() {
            flags |= SHARD_TIMING_INFO;
        }

        buf.put_u8(self.stream_item_idx);
        buf.put_u64_le(self.frame_idx);
        buf.put_u32_le(self.shard_idx);
        buf.put_u8(flags);
        if let Some(info) = &self.view_info {
            put_view_info(buf, info);
        }
        if let Some(timing) = &self.timing_info {
            put_timing_info(buf, timing);
        }
        buf.put_slice(&self.payload);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        need(buf, 14, "shard envelope")?;
        let stream_item_idx = buf.get_u8();
        let frame_idx = buf.get_u64_le();
        let shard_idx = buf.get_u32_le();
        let flags = buf.get_u8();

        let view_info = if flags & SHARD_VIEW_INFO != 0 {
            Some(get_view_info(buf)?)
        } else {
            None
        };
        let timing_info = if flags & SHARD_TIMING_INFO != 0 {
            Some(get_timing_info(buf)?)
        } else {
            None
        };

        // The payload is whatever is left of the datagram
        let payload = buf.split_to(buf.remaining());

        Ok(VideoShard {
            stream_item_idx,
            frame_idx,
            shard_idx,
            shard_count_known: flags & SHARD_COUNT_KNOWN != 0,
            is_last: flags & SHARD_LAST != 0,
            view_info,
            timing_info,
            payload,
        })
    }
}

impl Wire for VideoStreamDescription {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_f32_le(self.fps);
        buf.put_u8(self.items.len() as u8);
        for item in &self.items {
            buf.put_u8(match item.codec {
                VideoCodec::H264 => 0,
                VideoCodec::H265 => 1,
                VideoCodec::Raw => 2,
            });
            buf.put_u16_le(item.width);
            buf.put_u16_le(item.height);
            buf.put_u16_le(item.offset_x);
            buf.put_u16_le(item.offset_y);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        need(buf, 9, "video stream description")?;
        let width = buf.get_u16_le();
        let height = buf.get_u16_le();
        let fps = buf.get_f32_le();
        let count = buf.get_u8() as usize;
        need(buf, count * 9, "video stream items")?;

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let codec = match buf.get_u8() {
                0 => VideoCodec::H264,
                1 => VideoCodec::H265,
                2 => VideoCodec::Raw,
                other => bail!("unknown video codec {}", other),
            };
            items.push(VideoStreamItem {
                codec,
                width: buf.get_u16_le(),
                height: buf.get_u16_le(),
                offset_x: buf.get_u16_le(),
                offset_y: buf.get_u16_le(),
            });
        }

        Ok(VideoStreamDescription {
            width,
            height,
            fps,
            items,
        })
    }
}

impl Wire for ToHeadset {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ToHeadset::Handshake(handshake) => {
                buf.put_u8(0);
                buf.put_u32_le(handshake.protocol_version);
            }
            ToHeadset::VideoStreamDescription(description) => {
                buf.put_u8(1);
                description.encode(buf);
            }
            ToHeadset::VideoShard(shard) => {
                buf.put_u8(2);
                shard.encode(buf);
            }
            ToHeadset::Haptics(haptics) => {
                buf.put_u8(3);
                buf.put_u8(match haptics.device {
                    HapticsDevice::LeftController => 0,
                    HapticsDevice::RightController => 1,
                });
                buf.put_i64_le(haptics.duration_ns);
                buf.put_f32_le(haptics.frequency);
                buf.put_f32_le(haptics.amplitude);
            }
            ToHeadset::TimesyncQuery(query) => {
                buf.put_u8(4);
                buf.put_i64_le(query.query);
            }
            ToHeadset::AudioStreamDescription(description) => {
                buf.put_u8(5);
                put_audio_format(buf, description.speaker.as_ref());
                put_audio_format(buf, description.microphone.as_ref());
            }
            ToHeadset::AudioData(data) => {
                buf.put_u8(6);
                data.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        need(buf, 1, "packet tag")?;
        let packet = match buf.get_u8() {
            0 => {
                need(buf, 4, "handshake")?;
                ToHeadset::Handshake(Handshake {
                    protocol_version: buf.get_u32_le(),
                })
            }
            1 => ToHeadset::VideoStreamDescription(VideoStreamDescription::decode(buf)?),
            2 => ToHeadset::VideoShard(VideoShard::decode(buf)?),
            3 => {
                need(buf, 17, "haptics")?;
                let device = match buf.get_u8() {
                    0 => HapticsDevice::LeftController,
                    1 => HapticsDevice::RightController,
                    other => bail!("unknown haptics device {}", other),
                };
                ToHeadset::Haptics(Haptics {
                    device,
                    duration_ns: buf.get_i64_le(),
                    frequency: buf.get_f32_le(),
                    amplitude: buf.get_f32_le(),
                })
            }
            4 => {
                need(buf, 8, "timesync query")?;
                ToHeadset::TimesyncQuery(TimesyncQuery {
                    query: buf.get_i64_le(),
                })
            }
            5 => ToHeadset::AudioStreamDescription(AudioStreamDescription {
                speaker: get_audio_format(buf)?,
                microphone: get_audio_format(buf)?,
            }),
            6 => ToHeadset::AudioData(AudioData::decode(buf)?),
            other => bail!("unknown packet tag {}", other),
        };
        Ok(packet)
    }
}

impl Wire for FromHeadset {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            FromHeadset::HeadsetInfo(info) => {
                buf.put_u8(0);
                buf.put_f32_le(info.refresh_rate);
                put_audio_format(buf, Some(&info.audio.speaker));
                put_audio_format(buf, info.audio.microphone.as_ref());
            }
            FromHeadset::Tracking(tracking) => {
                buf.put_u8(1);
                buf.put_i64_le(tracking.timestamp);
                buf.put_i64_le(tracking.display_time);
                for pose in &tracking.views {
                    put_pose(buf, pose);
                }
            }
            FromHeadset::Feedback(feedback) => {
                buf.put_u8(2);
                buf.put_u8(feedback.stream_index);
                buf.put_u64_le(feedback.frame_index);
                buf.put_i64_le(feedback.received_first_packet);
                buf.put_i64_le(feedback.received_last_packet);
                buf.put_i64_le(feedback.sent_to_decoder);
                buf.put_i64_le(feedback.received_from_decoder);
                buf.put_i64_le(feedback.blitted);
                buf.put_i64_le(feedback.displayed);
                buf.put_u8(feedback.times_displayed);
                match &feedback.server_timing {
                    Some(timing) => {
                        buf.put_u8(1);
                        put_timing_info(buf, timing);
                    }
                    None => buf.put_u8(0),
                }
            }
            FromHeadset::TimesyncResponse(response) => {
                buf.put_u8(3);
                buf.put_i64_le(response.query);
                buf.put_i64_le(response.response);
            }
            FromHeadset::AudioData(data) => {
                buf.put_u8(4);
                data.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        need(buf, 1, "packet tag")?;
        let packet = match buf.get_u8() {
            0 => {
                need(buf, 4, "headset info")?;
                let refresh_rate = buf.get_f32_le();
                let speaker = get_audio_format(buf)?
                    .ok_or_else(|| anyhow!("headset info without speaker format"))?;
                let microphone = get_audio_format(buf)?;
                FromHeadset::HeadsetInfo(HeadsetInfo {
                    refresh_rate,
                    audio: AudioDescription {
                        speaker,
                        microphone,
                    },
                })
            }
            1 => {
                need(buf, 16, "tracking")?;
                let timestamp = buf.get_i64_le();
                let display_time = buf.get_i64_le();
                let mut views = [Pose::default(); VIEW_COUNT];
                for view in views.iter_mut() {
                    *view = get_pose(buf)?;
                }
                FromHeadset::Tracking(Tracking {
                    timestamp,
                    display_time,
                    views,
                })
            }
            2 => {
                need(buf, 1 + 8 * 7 + 1 + 1, "feedback")?;
                let mut feedback = Feedback {
                    stream_index: buf.get_u8(),
                    frame_index: buf.get_u64_le(),
                    received_first_packet: buf.get_i64_le(),
                    received_last_packet: buf.get_i64_le(),
                    sent_to_decoder: buf.get_i64_le(),
                    received_from_decoder: buf.get_i64_le(),
                    blitted: buf.get_i64_le(),
                    displayed: buf.get_i64_le(),
                    times_displayed: buf.get_u8(),
                    server_timing: None,
                };
                if buf.get_u8() != 0 {
                    feedback.server_timing = Some(get_timing_info(buf)?);
                }
                FromHeadset::Feedback(feedback)
            }
            3 => {
                need(buf, 16, "timesync response")?;
                FromHeadset::TimesyncResponse(TimesyncResponse {
                    query: buf.get_i64_le(),
                    response: buf.get_i64_le(),
                })
            }
            4 => FromHeadset::AudioData(AudioData::decode(buf)?),
            other => bail!("unknown packet tag {}", other),
        };
        Ok(packet)
    }
}
