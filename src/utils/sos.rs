use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One-way "exiting" flag shared by every thread a stream owns.
///
/// Threads poll [`SignalOfStop::cancelled`] between blocking operations, or
/// sleep in [`SignalOfStop::wait_timeout`] so that cancellation wakes them
/// immediately instead of at the end of their period.
#[derive(Debug)]
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);

        // Lock briefly so a waiter cannot miss the notification between its check and its wait
        let _guard = self.shared.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Sleep for at most `timeout`; returns true if cancelled meanwhile
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.shared.mutex.lock().unwrap_or_else(|e| e.into_inner());
        if self.cancelled() {
            return true;
        }

        let _ = self
            .shared
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.cancelled())
            .unwrap_or_else(|e| e.into_inner());

        self.cancelled()
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

// Implementing the Clone trait
impl Clone for SignalOfStop {
    fn clone(&self) -> SignalOfStop {
        SignalOfStop {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_timeout_elapses() {
        let sos = SignalOfStop::new();
        let start = Instant::now();
        assert!(!sos.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiters() {
        let sos = SignalOfStop::new();
        let waiter = sos.clone();

        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        sos.cancel();

        let (cancelled, waited) = handle.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }
}
