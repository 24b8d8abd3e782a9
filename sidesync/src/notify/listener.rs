//! Consumer side of the wake-up signal: a loopback UDP socket behind a mio
//! poll, so a consumer without its own event loop can park on it.

use std::io;

use mio::{Events, Interest, Poll, Token};

use super::parse_depth;
use crate::net::{Endpoint, UdpSocket};
use crate::sync::Timeout;

const SOCKET: Token = Token(0);

/// Largest payload we expect: a decimal `usize` plus slack.
const DATAGRAM_BUF: usize = 64;

/// Receives queue-depth notifications on `127.0.0.1:<port>`.
pub struct Listener {
    poll: Poll,
    events: Events,
    socket: UdpSocket,
    port: u16,
}

impl Listener {
    /// Binds to `127.0.0.1:<port>`; pass 0 for an ephemeral port and read it
    /// back with [`Listener::port`].
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or registered.
    pub fn bind(port: u16) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(Endpoint::localhost(port))?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)?;
        let port = socket.local_addr()?.port();
        Ok(Self {
            poll,
            events: Events::with_capacity(8),
            socket,
            port,
        })
    }

    /// The bound port, to hand to `Host::set_notification_port`.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Reads every queued datagram without blocking.
    ///
    /// Returns the depth carried by the most recent well-formed datagram, or
    /// `None` if nothing parseable was waiting.
    ///
    /// # Errors
    ///
    /// Returns socket errors other than `WouldBlock`.
    pub fn drain(&mut self) -> io::Result<Option<usize>> {
        let mut buf = [0u8; DATAGRAM_BUF];
        let mut latest = None;
        while let Some((n, _from)) = self.socket.try_recv_from(&mut buf)? {
            if let Some(depth) = parse_depth(&buf[..n]) {
                latest = Some(depth);
            }
        }
        Ok(latest)
    }

    /// Blocks until a notification arrives or `timeout` elapses.
    ///
    /// Datagrams already waiting are returned without blocking. `Ok(None)`
    /// means the timeout elapsed (or only malformed datagrams arrived).
    ///
    /// # Errors
    ///
    /// Returns poll or socket errors. An interrupted wait is reported as
    /// `Ok(None)`.
    pub fn wait(&mut self, timeout: Timeout) -> io::Result<Option<usize>> {
        if let Some(depth) = self.drain()? {
            return Ok(Some(depth));
        }
        let timeout = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(d),
        };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }
        if self.events.is_empty() {
            return Ok(None);
        }
        self.drain()
    }
}
