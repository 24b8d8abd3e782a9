//! Synchronization primitives shared by producers and the consumer loop.

pub mod gate;

use std::time::Duration;

pub use gate::WaitGate;
pub(crate) use gate::GateGuard;

/// How long a blocking wait may last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}
