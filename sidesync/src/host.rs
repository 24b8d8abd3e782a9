//! Host runtime: one delivery queue, its producers, and its lifecycle.
//!
//! # Architecture
//!
//! A [`Host`] is owned by the consumer. It hands out a cloneable [`Api`] that
//! background producers use to register and deliver. All host state sits
//! behind one mutex; decode, reply and cancel callbacks always run with that
//! mutex released, so they may call back into the host.
//!
//! ```text
//! producer threads                       consumer thread
//! ----------------                       ---------------
//! register ─┐
//! deliver ──┼──► [ queue ] ──── poll ──► decode ──► outputs
//!   (wait)  │                              │
//!     ▲     │                          [ awaiting ]
//!     └─────┴────────── gate ◄──────── complete ◄── PendingReply
//! ```
//!
//! # Lifecycle
//!
//! `start` moves a host straight to `Started`. `shutdown` moves it to
//! `Stopping`, asks every producer (newest first) to cancel, then settles in
//! `Stopped`, which is terminal.
//!
//! # Example
//!
//! ```ignore
//! use sidesync::{Host, HostConfig, Identity, Polled, decoder, Flow};
//!
//! let host: Host<String> = Host::start(HostConfig::default());
//! let api = host.api();
//!
//! std::thread::spawn(move || {
//!     let handle = api
//!         .register(Identity::new(1), Some(Box::new(|h| { let _ = h.unregister(); })), None)?
//!         .into_handle();
//!     handle.send(|ctx| { ctx.push("hello".into()); Flow::Done }, ())?;
//!     Ok::<_, sidesync::Error>(())
//! });
//!
//! while let Polled::Ready(taken) = host.poll() {
//!     println!("{:?}", taken.outputs);
//! }
//! host.shutdown();
//! ```

pub mod state;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, OnceLock};

use crate::notify::{NotificationChannel, NotifyError, SinkFactory, UdpSinkFactory};
use crate::producer::{Api, ProducerHandle};
use crate::trace::{debug, info, warn};
use crate::Polled;

pub use state::HostStatus;
use state::{HostState, Shared};

/// Host configuration.
#[derive(Clone)]
pub struct HostConfig {
    /// Initial wake-up notification port; 0 disables notifications.
    pub notification_port: u16,
    /// Opens the notification transport. Defaults to UDP loopback.
    pub sink_factory: Arc<dyn SinkFactory>,
    /// Name used in log output.
    pub name: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            notification_port: 0,
            sink_factory: Arc::new(UdpSinkFactory),
            name: String::from("sidesync"),
        }
    }
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("notification_port", &self.notification_port)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Consumer-side owner of a delivery queue.
///
/// Dropping a host that is still started shuts it down.
pub struct Host<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Host<V> {
    /// Creates a host and moves it to `Started`.
    ///
    /// A notification port that cannot be opened yet is kept and retried on
    /// the next delivery.
    #[must_use]
    pub fn start(config: HostConfig) -> Self {
        let HostConfig {
            notification_port,
            sink_factory,
            name,
        } = config;

        let mut state = HostState::new(NotificationChannel::disabled(sink_factory));
        if let Err(_e) = state.notify.set_port(notification_port) {
            warn!(host = %name, port = notification_port, error = %_e, "notification port not opened");
        }
        state.status = HostStatus::Started;
        info!(host = %name, port = notification_port, "host started");

        Self {
            shared: Arc::new(Shared::new(state, name)),
        }
    }

    /// The producer-facing function table.
    #[must_use]
    pub fn api(&self) -> Api<V> {
        Api::new(Arc::clone(&self.shared))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    #[must_use]
    pub fn status(&self) -> HostStatus {
        self.shared.lock().status
    }

    /// Takes the oldest queued item and runs its decode callback here.
    ///
    /// Must only be called from the consumer thread.
    pub fn poll(&self) -> Polled<V> {
        self.shared.take()
    }

    /// Number of items waiting to be taken.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Number of decoded items waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.lock().queue.awaiting_len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.shared.lock().registry.len()
    }

    /// Points wake-up notifications at `port` (0 disables them).
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Open`] if the transport cannot be opened. The
    /// port is stored regardless and retried on the next delivery.
    pub fn set_notification_port(&self, port: u16) -> Result<(), NotifyError> {
        let mut state = self.shared.lock();
        debug!(host = %self.shared.name(), port, "notification port changed");
        state.notify.set_port(port)
    }

    #[must_use]
    pub fn notification_port(&self) -> u16 {
        self.shared.lock().notify.port()
    }

    /// Stops the host: refuses new registrations and deliveries, cancels every
    /// producer newest first, then disables notifications.
    ///
    /// Each producer's cancel callback runs without the host lock and is
    /// expected to unregister. A producer still registered afterwards is
    /// unregistered here, which cancels whatever it still owns. Calling this
    /// on a host that is not started does nothing.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic of a cancel callback once the host has
    /// reached `Stopped`.
    pub fn shutdown(&self) {
        if let Some(payload) = self.stop() {
            resume_unwind(payload);
        }
    }

    /// Runs the shutdown sequence to `Stopped` and returns the first callback
    /// panic, if any.
    fn stop(&self) -> Option<Box<dyn Any + Send>> {
        {
            let mut state = self.shared.lock();
            if !state.is_started() {
                return None;
            }
            state.status = HostStatus::Stopping;
        }
        info!(host = %self.shared.name(), "host stopping");

        let mut panicked = None;
        loop {
            let (key, identity, cancel) = {
                let mut state = self.shared.lock();
                let Some(key) = state.registry.last() else {
                    break;
                };
                let Some(identity) = state.registry.identity(key) else {
                    break;
                };
                (key, identity, state.registry.take_cancel(key))
            };

            if let Some(cancel) = cancel {
                let handle = ProducerHandle::new(Arc::clone(&self.shared), key, identity);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| cancel(handle))) {
                    warn!(
                        host = %self.shared.name(),
                        %identity,
                        "producer cancel callback panicked"
                    );
                    panicked.get_or_insert(payload);
                }
            }

            if self.shared.is_registered(key) {
                warn!(
                    host = %self.shared.name(),
                    %identity,
                    "producer still registered after cancel, unregistering"
                );
                let unregister = AssertUnwindSafe(|| self.shared.unregister(key));
                if let Err(payload) = catch_unwind(unregister) {
                    panicked.get_or_insert(payload);
                }
            }
        }

        let mut state = self.shared.lock();
        state.status = HostStatus::Stopped;
        state.notify.disable();
        drop(state);
        info!(host = %self.shared.name(), "host stopped");
        panicked
    }
}

impl<V> Drop for Host<V> {
    fn drop(&mut self) {
        if self.stop().is_some() {
            warn!(host = %self.shared.name(), "cancel callback panicked during drop");
        }
    }
}

/// Lazily started host, one per slot.
///
/// Repeated `get_or_start` calls return the same host.
pub struct HostSlot<V> {
    host: OnceLock<Host<V>>,
}

impl<V> Default for HostSlot<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HostSlot<V> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            host: OnceLock::new(),
        }
    }

    /// Returns the slot's host, starting it with `config()` on first use.
    pub fn get_or_start(&self, config: impl FnOnce() -> HostConfig) -> &Host<V> {
        self.host.get_or_init(|| Host::start(config()))
    }

    #[must_use]
    pub fn get(&self) -> Option<&Host<V>> {
        self.host.get()
    }
}
