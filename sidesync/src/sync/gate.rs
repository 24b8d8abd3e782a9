//! One-shot wait gate used for round-trip deliveries.
//!
//! A gate starts closed. The consumer side opens it exactly once when the
//! item it belongs to is finalized; the producer blocked in `deliver` waits
//! on it and drops its reference afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use minstant::Instant;

use super::Timeout;

/// Binary gate: closed on creation, open after [`signal`](Self::signal).
#[derive(Debug, Default)]
pub struct WaitGate {
    open: Mutex<bool>,
    cond: Condvar,
    signals: AtomicUsize,
}

impl WaitGate {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the gate and wakes every waiter. Opening an open gate is a no-op
    /// apart from the signal counter.
    pub fn signal(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
        let mut open = self.state();
        *open = true;
        self.cond.notify_all();
    }

    /// Blocks until the gate is open.
    pub fn wait(&self) {
        let mut open = self.state();
        while !*open {
            open = self
                .cond
                .wait(open)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the gate is open or `timeout` elapses.
    ///
    /// Returns `true` if the gate opened.
    pub fn wait_timeout(&self, timeout: Timeout) -> bool {
        let deadline = match timeout {
            Timeout::Infinite => {
                self.wait();
                return true;
            }
            Timeout::Duration(d) => Instant::now() + d,
        };

        let mut open = self.state();
        while !*open {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            open = self
                .cond
                .wait_timeout(open, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Returns whether the gate has been opened.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.state()
    }

    /// Number of times [`signal`](Self::signal) was called.
    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.signals.load(Ordering::Relaxed)
    }
}

/// An item's share of its gate. Opens the gate when dropped.
///
/// Items carry this from push to finalization, so an item that is dropped
/// on any path, including an unwind, still releases its producer.
#[derive(Debug, Default)]
pub(crate) struct GateGuard(Option<Arc<WaitGate>>);

impl GateGuard {
    pub(crate) const fn new(gate: Option<Arc<WaitGate>>) -> Self {
        Self(gate)
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if let Some(gate) = self.0.take() {
            gate.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn starts_closed() {
        let gate = WaitGate::new();
        assert!(!gate.is_open());
        assert!(!gate.wait_timeout(Timeout::Duration(Duration::from_millis(5))));
    }

    #[test]
    fn signal_before_wait_does_not_block() {
        let gate = WaitGate::new();
        gate.signal();
        gate.wait();
        assert!(gate.is_open());
        assert_eq!(gate.signal_count(), 1);
    }

    #[test]
    fn signal_releases_blocked_thread() {
        let gate = Arc::new(WaitGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait();
                true
            })
        };

        thread::sleep(Duration::from_millis(10));
        gate.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn releases_every_waiter() {
        let gate = Arc::new(WaitGate::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait_timeout(Timeout::Infinite))
            })
            .collect();

        gate.signal();
        for w in waiters {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn guard_opens_gate_once_on_drop() {
        let gate = Arc::new(WaitGate::new());
        let guard = GateGuard::new(Some(Arc::clone(&gate)));
        assert!(!gate.is_open());

        drop(guard);
        assert!(gate.is_open());
        assert_eq!(gate.signal_count(), 1);

        drop(GateGuard::default());
        assert_eq!(gate.signal_count(), 1);
    }
}
