//! Sending side of the wake-up signal.

use std::io;
use std::num::NonZeroU16;
use std::sync::Arc;

use thiserror::Error;

use super::encode_depth;
use crate::net::{Endpoint, UdpSocket};
use crate::trace::{debug, warn};

/// Errors from the notification transport. Never fatal to delivery.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The transport could not be opened for the configured port.
    #[error("failed to open notification socket for port {port}: {source}")]
    Open {
        port: u16,
        #[source]
        source: io::Error,
    },
    /// Sending failed, including the single reopen-and-retry.
    #[error("notification send failed: {0}")]
    Send(#[source] io::Error),
}

/// An open transport that can carry notification payloads.
pub trait NotifySink: Send {
    /// Sends one payload.
    ///
    /// # Errors
    ///
    /// Any I/O failure; the caller decides whether to reopen.
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;
}

/// Opens [`NotifySink`]s for a port.
///
/// The default is [`UdpSinkFactory`]; tests substitute factories whose sinks
/// fail on demand.
pub trait SinkFactory: Send + Sync {
    /// Opens a sink targeting `port` on loopback.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the transport cannot be created.
    fn open(&self, port: NonZeroU16) -> io::Result<Box<dyn NotifySink>>;
}

/// Opens UDP sockets that send to `127.0.0.1:<port>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpSinkFactory;

struct UdpSink {
    socket: UdpSocket,
    target: Endpoint,
}

impl NotifySink for UdpSink {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.target).map(|_| ())
    }
}

impl SinkFactory for UdpSinkFactory {
    fn open(&self, port: NonZeroU16) -> io::Result<Box<dyn NotifySink>> {
        let socket = UdpSocket::bind(Endpoint::localhost(0))?;
        Ok(Box::new(UdpSink {
            socket,
            target: Endpoint::localhost(port.get()),
        }))
    }
}

/// The host's notification channel: a port (0 = disabled) plus the open sink.
///
/// Owned by the host state and only touched under the host lock.
pub struct NotificationChannel {
    port: Option<NonZeroU16>,
    sink: Option<Box<dyn NotifySink>>,
    factory: Arc<dyn SinkFactory>,
}

impl NotificationChannel {
    /// Creates a disabled channel (port 0).
    #[must_use]
    pub fn disabled(factory: Arc<dyn SinkFactory>) -> Self {
        Self {
            port: None,
            sink: None,
            factory,
        }
    }

    /// Configured port, 0 when disabled.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.map_or(0, NonZeroU16::get)
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.port.is_some()
    }

    /// Closes the current sink, stores `port`, and opens a new sink unless
    /// `port` is 0.
    ///
    /// The port is kept even if opening fails; the next notification will try
    /// to open it again.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Open`] if the new sink cannot be created.
    pub fn set_port(&mut self, port: u16) -> Result<(), NotifyError> {
        self.close();
        self.port = NonZeroU16::new(port);
        match self.port {
            Some(port) => self.reopen(port),
            None => Ok(()),
        }
    }

    /// Drops the open sink, keeping the configured port.
    pub fn close(&mut self) {
        self.sink = None;
    }

    /// Closes the sink and sets the port to 0.
    pub fn disable(&mut self) {
        self.close();
        self.port = None;
    }

    fn reopen(&mut self, port: NonZeroU16) -> Result<(), NotifyError> {
        self.sink = None;
        let sink = self
            .factory
            .open(port)
            .map_err(|source| NotifyError::Open {
                port: port.get(),
                source,
            })?;
        self.sink = Some(sink);
        Ok(())
    }

    fn try_send(&mut self, payload: &[u8]) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.send(payload),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "notification sink is not open",
            )),
        }
    }

    /// Sends `depth` if the channel is enabled.
    ///
    /// On failure the sink is closed and reopened once and the send retried.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the retry also fails. The caller reports
    /// this as a warning only.
    pub fn notify(&mut self, depth: usize) -> Result<(), NotifyError> {
        let Some(port) = self.port else {
            return Ok(());
        };
        let payload = encode_depth(depth);

        if let Err(_e) = self.try_send(payload.as_bytes()) {
            debug!(port = port.get(), error = %_e, "notification failed, reopening");
            self.reopen(port)?;
            self.try_send(payload.as_bytes()).map_err(|e| {
                warn!(port = port.get(), error = %e, "notification retry failed");
                NotifyError::Send(e)
            })?;
        }
        Ok(())
    }
}
