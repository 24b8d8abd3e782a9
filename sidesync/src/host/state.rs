//! The single lock-guarded record behind a host.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::notify::NotificationChannel;
use crate::queue::DeliveryQueue;
use crate::registry::Registry;

/// Lifecycle of a host. `Stopped` is terminal once reached from `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Stopped,
    Started,
    Stopping,
}

/// Everything a host mutates, guarded together.
pub(crate) struct HostState<V> {
    pub(crate) status: HostStatus,
    pub(crate) registry: Registry<V>,
    pub(crate) queue: DeliveryQueue<V>,
    pub(crate) notify: NotificationChannel,
}

impl<V> HostState<V> {
    pub(crate) const fn new(notify: NotificationChannel) -> Self {
        Self {
            status: HostStatus::Stopped,
            registry: Registry::new(),
            queue: DeliveryQueue::new(),
            notify,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.status == HostStatus::Started
    }
}

/// Shared between the host, the producer API and every handle.
pub(crate) struct Shared<V> {
    state: Mutex<HostState<V>>,
    name: String,
}

impl<V> Shared<V> {
    pub(crate) const fn new(state: HostState<V>, name: String) -> Self {
        Self {
            state: Mutex::new(state),
            name,
        }
    }

    /// Locks the host state. User callbacks never run under this lock, so a
    /// poisoned lock only means a panic inside our own bookkeeping; the state
    /// is still consistent and is used as is.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HostState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}
