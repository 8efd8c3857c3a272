//! Server connection: packet types, binary codec and transports

pub mod packets;
pub mod session;
pub mod udp;
pub mod wire;

pub use packets::{FromHeadset, ToHeadset};
pub use session::{LoopbackSession, Session};
pub use udp::UdpSession;
