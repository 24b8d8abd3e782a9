//! Best-effort wake-up notifications.
//!
//! After every delivery the host sends the new queue depth, as ASCII decimal,
//! to `127.0.0.1:<port>`. The datagram is purely advisory: it lets a consumer
//! that is parked in its own I/O wait know there is something to poll. Losing
//! one never loses work.

pub mod channel;
pub mod listener;

pub use channel::{NotificationChannel, NotifyError, NotifySink, SinkFactory, UdpSinkFactory};
pub use listener::Listener;

/// Encodes a queue depth as the notification payload.
#[must_use]
pub fn encode_depth(depth: usize) -> String {
    depth.to_string()
}

/// Parses a notification payload back into a queue depth.
///
/// Surrounding whitespace and trailing NULs are tolerated; anything else that
/// is not a plain decimal yields `None`.
#[must_use]
pub fn parse_depth(payload: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(payload).ok()?;
    text.trim_end_matches('\0').trim().parse().ok()
}
