//! Transport seam between the stream threads and the server connection

use crate::net::packets::{FromHeadset, ToHeadset};
use crate::net::wire::encode_packet;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A bidirectional packet connection to the rendering server.
///
/// `receive` is called only by the network thread; `send` may be called by
/// any stream thread concurrently.
pub trait Session: Send + Sync {
    /// Wait up to `timeout` for the next inbound packet.
    /// `Ok(None)` means nothing arrived in time.
    fn receive(&self, timeout: Duration) -> Result<Option<ToHeadset>>;

    /// Returns the number of bytes put on the transport
    fn send(&self, packet: FromHeadset) -> Result<usize>;
}

/// In-memory session: the test (or an embedding app) plays the server side.
#[derive(Default)]
pub struct LoopbackSession {
    inbound: Mutex<VecDeque<ToHeadset>>,
    inbound_ready: Condvar,
    outbound: Mutex<Vec<FromHeadset>>,
}

impl LoopbackSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet as if the server had sent it
    pub fn inject(&self, packet: ToHeadset) {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(packet);
        self.inbound_ready.notify_one();
    }

    /// Everything the headset sent so far, draining it
    pub fn take_sent(&self) -> Vec<FromHeadset> {
        std::mem::take(&mut *self.outbound.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Session for LoopbackSession {
    fn receive(&self, timeout: Duration) -> Result<Option<ToHeadset>> {
        let deadline = Instant::now() + timeout;
        let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(packet) = inbound.pop_front() {
                return Ok(Some(packet));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            inbound = self
                .inbound_ready
                .wait_timeout(inbound, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn send(&self, packet: FromHeadset) -> Result<usize> {
        let size = encode_packet(&packet).len();
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(packet);
        Ok(size)
    }
}
