//! Packets exchanged between the rendering server and the headset

use crate::assets::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, VIEW_COUNT};
use bytes::Bytes;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose {
    /// Quaternion, x y z w
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: [0.0, 0.0, 0.0, 1.0],
        position: [0.0, 0.0, 0.0],
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

/// Pose and field of view the server rendered a frame with, needed for reprojection
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewInfo {
    pub display_time: i64,
    pub pose: [Pose; VIEW_COUNT],
    pub fov: [Fov; VIEW_COUNT],
}

/// Server-side timestamps of a frame, in server clock nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingInfo {
    pub encode_begin: i64,
    pub encode_end: i64,
    pub send_begin: i64,
    pub send_end: i64,
}

/// One network-sized fragment of an encoded video frame
#[derive(Debug, Clone, PartialEq)]
pub struct VideoShard {
    /// Sub-stream (accumulator) this shard belongs to
    pub stream_item_idx: u8,
    pub frame_idx: u64,
    pub shard_idx: u32,
    /// Whether the sender already knows how many shards make up the frame.
    /// Required on the last shard, whose index fixes the count.
    pub shard_count_known: bool,
    pub is_last: bool,
    /// Carried by the first shard of a frame
    pub view_info: Option<ViewInfo>,
    pub timing_info: Option<TimingInfo>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    /// Packed YUV420p, no compression
    Raw,
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::H265 => write!(f, "h265"),
            VideoCodec::Raw => write!(f, "raw"),
        }
    }
}

/// Layout of one sub-stream inside the full stereo image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoStreamItem {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub offset_x: u16,
    pub offset_y: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamDescription {
    pub width: u16,
    pub height: u16,
    pub fps: f32,
    pub items: Vec<VideoStreamItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub num_channels: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            num_channels: DEFAULT_CHANNELS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStreamDescription {
    pub speaker: Option<AudioFormat>,
    pub microphone: Option<AudioFormat>,
}

/// A chunk of interleaved 16-bit samples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioData {
    /// Stream clock nanoseconds of the first sample
    pub timestamp: i64,
    pub samples: Vec<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapticsDevice {
    LeftController,
    RightController,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Haptics {
    pub device: HapticsDevice,
    pub duration_ns: i64,
    pub frequency: f32,
    pub amplitude: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimesyncQuery {
    pub query: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimesyncResponse {
    pub query: i64,
    pub response: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tracking {
    pub timestamp: i64,
    pub display_time: i64,
    pub views: [Pose; VIEW_COUNT],
}

/// Per-frame telemetry for the server's adaptive logic, headset clock nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Feedback {
    pub stream_index: u8,
    pub frame_index: u64,
    pub received_first_packet: i64,
    pub received_last_packet: i64,
    pub sent_to_decoder: i64,
    pub received_from_decoder: i64,
    pub blitted: i64,
    pub displayed: i64,
    pub times_displayed: u8,
    /// Encode and send times the server attached to the frame, echoed back
    pub server_timing: Option<TimingInfo>,
}

/// Audio capabilities advertised to the server before streaming starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioDescription {
    pub speaker: AudioFormat,
    pub microphone: Option<AudioFormat>,
}

impl AudioDescription {
    pub fn microphone_enabled(&self) -> bool {
        self.microphone.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadsetInfo {
    pub refresh_rate: f32,
    pub audio: AudioDescription,
}

/// Server to headset
#[derive(Debug, Clone, PartialEq)]
pub enum ToHeadset {
    Handshake(Handshake),
    VideoStreamDescription(VideoStreamDescription),
    VideoShard(VideoShard),
    Haptics(Haptics),
    TimesyncQuery(TimesyncQuery),
    AudioStreamDescription(AudioStreamDescription),
    AudioData(AudioData),
}

/// Headset to server
#[derive(Debug, Clone, PartialEq)]
pub enum FromHeadset {
    HeadsetInfo(HeadsetInfo),
    Tracking(Tracking),
    Feedback(Feedback),
    TimesyncResponse(TimesyncResponse),
    AudioData(AudioData),
}
