//! Two-phase stop handshake between a stream owner and a hardware callback
//!
//! The owner raises `stop_requested`; the callback's next invocation raises
//! `stop_acknowledged` and returns [`CallbackResult::Stop`] without touching
//! any buffer. Only after the acknowledgement does the owner close the
//! hardware stream and release the buffers the callback was reading.

use log::warn;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// What a hardware callback tells its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
pub struct StopGate {
    stop_requested: AtomicBool,
    stop_acknowledged: AtomicBool,
    in_flight: AtomicUsize,
    /// Invocations past the flag check
    running: AtomicUsize,
    invoked: AtomicBool,
}

/// Marks a callback invocation as in progress until dropped
pub struct InFlight<'a> {
    gate: &'a StopGate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gate.running.fetch_sub(1, Ordering::SeqCst);
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StopGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called at the top of every callback invocation. `None` means a stop
    /// was requested: the invocation is acknowledged and must return
    /// [`CallbackResult::Stop`] without touching shared state.
    pub fn enter(&self) -> Option<InFlight<'_>> {
        // Counted before the flag check so the owner can tell when no
        // invocation can still be past it
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.invoked.store(true, Ordering::SeqCst);
        if self.stop_requested.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.stop_acknowledged.store(true, Ordering::SeqCst);
            return None;
        }
        self.running.fetch_add(1, Ordering::SeqCst);
        Some(InFlight { gate: self })
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Invocations currently allowed to touch shared state
    pub(crate) fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether any callback invocation ever reached the gate
    pub fn has_run(&self) -> bool {
        self.invoked.load(Ordering::SeqCst)
    }

    pub fn acknowledged(&self) -> bool {
        self.stop_acknowledged.load(Ordering::SeqCst)
    }

    /// Wait for the callback to acknowledge a requested stop, then for every
    /// invocation that passed the gate before the request to return.
    ///
    /// Returns false if the callback never came back within `timeout` (the
    /// backend stopped calling it). The gate then acknowledges on the
    /// callback's behalf: every later invocation sees the request first.
    pub fn wait_stopped(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut acknowledged = true;
        while !self.acknowledged() {
            if Instant::now() >= deadline {
                acknowledged = false;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(1));
        }

        if !acknowledged {
            warn!(
                "{}: callback did not acknowledge stop within {:?}, assuming quiesced",
                name, timeout
            );
            self.stop_acknowledged.store(true, Ordering::SeqCst);
        }
        acknowledged
    }
}
