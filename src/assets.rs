use std::time::Duration;

// video
pub const VIEW_COUNT: usize = 2;
pub const RECENT_FRAMES: usize = 3;
pub const DEFAULT_FRAME_RATE: f32 = 72.0;
pub const MIN_FRAME_RATE: f32 = 1.0;
pub const MAX_FRAME_RATE: f32 = 1000.0;
pub const SHARD_TIMEOUT: Duration = Duration::from_millis(100);
pub const SHARD_QUEUE_CAPACITY: usize = 1024;
pub const STALL_MULTIPLIER: f32 = 5.0;
pub const MAX_SHARDS_PER_FRAME: u32 = 8192;

// audio
pub const SPEAKER_RING_CAPACITY: usize = 1000;
pub const MICROPHONE_RING_CAPACITY: usize = 1000;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u8 = 2;
pub const AUDIO_STOP_TIMEOUT: Duration = Duration::from_millis(500);

// connections
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const TRACKING_INTERVAL: Duration = Duration::from_millis(5);
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
pub const STREAM_SERVICE_PORT: u16 = 9757;
