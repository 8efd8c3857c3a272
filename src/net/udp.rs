//! Datagram transport: one packet per UDP datagram

use crate::assets::MAX_DATAGRAM_SIZE;
use crate::net::packets::{FromHeadset, ToHeadset};
use crate::net::session::Session;
use crate::net::wire::{decode_packet, encode_packet};
use anyhow::{Context, Result};
use bytes::Bytes;
use log::{debug, info};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

pub struct UdpSession {
    socket: UdpSocket,
    peer: SocketAddr,
    recv_buf: Mutex<Vec<u8>>,
}

impl UdpSession {
    /// Bind `local` and exchange datagrams with the server at `peer` only
    pub fn connect(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).with_context(|| format!("bind {}", local))?;
        socket
            .connect(peer)
            .with_context(|| format!("connect to {}", peer))?;

        info!(
            "UdpSession: {} <-> {}",
            socket.local_addr().unwrap_or(local),
            peer
        );

        Ok(Self {
            socket,
            peer,
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Session for UdpSession {
    fn receive(&self, timeout: Duration) -> Result<Option<ToHeadset>> {
        // A zero timeout means "block forever" to the socket API
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = self.recv_buf.lock().unwrap_or_else(|e| e.into_inner());
        let len = match self.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None);
            }
            // Reported on some platforms when the peer is not listening yet
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match decode_packet(Bytes::copy_from_slice(&buf[..len])) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => {
                // Corrupt datagrams are transport loss, not a session failure
                debug!("UdpSession: dropping {} byte datagram: {}", len, e);
                Ok(None)
            }
        }
    }

    fn send(&self, packet: FromHeadset) -> Result<usize> {
        let datagram = encode_packet(&packet);
        let sent = self
            .socket
            .send(&datagram)
            .with_context(|| format!("send to {}", self.peer))?;
        Ok(sent)
    }
}
