//! Producer registry: who may deliver to a host.
//!
//! Entries live in a generational slab so a handle that outlives its
//! registration is rejected instead of aliasing a newer producer. A separate
//! order vector preserves registration order for shutdown, which cancels
//! producers newest first.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

use crate::error::Error;
use crate::host::state::Shared;
use crate::producer::{ProducerHandle, Registered};
use crate::slab::{Key, Slab};
use crate::trace::{debug, warn};

/// Caller-supplied token identifying a producer within one host.
///
/// Equality is token equality: two registrations collide only if they pass
/// the same token, never by comparing what the token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(usize);

impl Identity {
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Uses the address of a static as the token, the usual choice for a
    /// library that registers exactly once.
    #[must_use]
    pub fn of<T: ?Sized>(anchor: &'static T) -> Self {
        Self(std::ptr::from_ref(anchor).cast::<()>().addr())
    }

    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque value a producer can attach to its registration.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Invoked by host shutdown, outside the host lock, to ask a producer to stop.
/// The callback is expected to end with [`ProducerHandle::unregister`].
pub type CancelFn<V> = Box<dyn FnOnce(ProducerHandle<V>) + Send>;

pub(crate) type ProducerKey<V> = Key<Entry<V>>;

/// Snapshot of the producer an item belongs to, handed to decode and reply
/// callbacks.
#[derive(Clone)]
pub struct Origin {
    identity: Identity,
    data: Option<UserData>,
}

impl Origin {
    pub(crate) const fn new(identity: Identity, data: Option<UserData>) -> Self {
        Self { identity, data }
    }

    #[must_use]
    pub const fn identity(&self) -> Identity {
        self.identity
    }

    #[must_use]
    pub const fn data(&self) -> Option<&UserData> {
        self.data.as_ref()
    }

    /// Downcasts the attached user data.
    #[must_use]
    pub fn data_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|d| d.downcast_ref())
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Origin")
            .field("identity", &self.identity)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

pub(crate) struct Entry<V> {
    identity: Identity,
    cancel: Option<CancelFn<V>>,
    data: Option<UserData>,
}

impl<V> Entry<V> {
    pub(crate) fn origin(&self) -> Origin {
        Origin::new(self.identity, self.data.clone())
    }
}

pub(crate) struct Registry<V> {
    entries: Slab<Entry<V>>,
    order: Vec<ProducerKey<V>>,
}

impl<V> Registry<V> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Slab::new(),
            order: Vec::new(),
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Linear scan; producer counts are small.
    pub(crate) fn lookup(&self, identity: Identity) -> Option<ProducerKey<V>> {
        self.order
            .iter()
            .copied()
            .find(|k| self.entries.get(*k).is_some_and(|e| e.identity == identity))
    }

    pub(crate) fn validate(&self, key: ProducerKey<V>) -> bool {
        self.entries.contains(key)
    }

    pub(crate) fn insert(
        &mut self,
        identity: Identity,
        cancel: CancelFn<V>,
        data: Option<UserData>,
    ) -> Result<ProducerKey<V>, Error> {
        self.order.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        let key = self.entries.insert(Entry {
            identity,
            cancel: Some(cancel),
            data,
        })?;
        self.order.push(key);
        Ok(key)
    }

    pub(crate) fn remove(&mut self, key: ProducerKey<V>) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        Some(entry)
    }

    /// Most recently registered producer still linked.
    pub(crate) fn last(&self) -> Option<ProducerKey<V>> {
        self.order.last().copied()
    }

    pub(crate) fn identity(&self, key: ProducerKey<V>) -> Option<Identity> {
        self.entries.get(key).map(|e| e.identity)
    }

    /// Takes the cancel callback, leaving the producer registered.
    pub(crate) fn take_cancel(&mut self, key: ProducerKey<V>) -> Option<CancelFn<V>> {
        self.entries.get_mut(key).and_then(|e| e.cancel.take())
    }

    pub(crate) fn origin(&self, key: ProducerKey<V>) -> Option<Origin> {
        self.entries.get(key).map(Entry::origin)
    }

    fn data(&self, key: ProducerKey<V>) -> Result<Option<UserData>, Error> {
        self.entries
            .get(key)
            .map(|e| e.data.clone())
            .ok_or(Error::InvalidHandle)
    }

    fn set_data(
        &mut self,
        key: ProducerKey<V>,
        data: Option<UserData>,
    ) -> Result<Option<UserData>, Error> {
        let entry = self.entries.get_mut(key).ok_or(Error::InvalidHandle)?;
        Ok(std::mem::replace(&mut entry.data, data))
    }
}

impl<V> Shared<V> {
    /// Registers `identity`, or returns its existing handle.
    pub(crate) fn register(
        self: &Arc<Self>,
        identity: Identity,
        cancel: Option<CancelFn<V>>,
        data: Option<UserData>,
    ) -> Result<Registered<V>, Error> {
        let mut state = self.lock();
        if !state.is_started() {
            return Err(Error::NotStarted);
        }
        let Some(cancel) = cancel else {
            return Err(Error::NoCancelProvided);
        };

        if let Some(key) = state.registry.lookup(identity) {
            drop(state);
            debug!(host = %self.name(), %identity, "producer already registered");
            return Ok(Registered::Existing(ProducerHandle::new(
                Arc::clone(self),
                key,
                identity,
            )));
        }

        let key = state.registry.insert(identity, cancel, data)?;
        debug!(
            host = %self.name(),
            %identity,
            producers = state.registry.len(),
            "producer registered"
        );
        drop(state);
        Ok(Registered::New(ProducerHandle::new(
            Arc::clone(self),
            key,
            identity,
        )))
    }

    /// Unlinks the producer, then cancels every item it still owns.
    ///
    /// Queued items are cancelled before items awaiting completion; both in
    /// the order they were accepted. Callbacks run without the host lock.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic of a cancel callback, after every item has
    /// been finalized and every gate opened.
    pub(crate) fn unregister(&self, key: ProducerKey<V>) -> Result<(), Error> {
        let (entry, queued, awaiting) = {
            let mut state = self.lock();
            let entry = state.registry.remove(key).ok_or(Error::InvalidHandle)?;
            let (queued, awaiting) = state.queue.detach_owner(key);
            (entry, queued, awaiting)
        };

        debug!(
            host = %self.name(),
            identity = %entry.identity,
            queued = queued.len(),
            awaiting = awaiting.len(),
            "producer unregistered"
        );

        // Every detached item is finalized before the first callback panic
        // is re-raised.
        let origin = entry.origin();
        let mut panicked = None;
        for item in queued {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| item.cancel(&origin))) {
                warn!(host = %self.name(), identity = %entry.identity, "cancel decode panicked");
                panicked.get_or_insert(payload);
            }
        }
        for item in awaiting {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| item.cancel())) {
                warn!(host = %self.name(), identity = %entry.identity, "cancel reply panicked");
                panicked.get_or_insert(payload);
            }
        }
        if let Some(payload) = panicked {
            resume_unwind(payload);
        }
        Ok(())
    }

    pub(crate) fn is_registered(&self, key: ProducerKey<V>) -> bool {
        self.lock().registry.validate(key)
    }

    pub(crate) fn data(&self, key: ProducerKey<V>) -> Result<Option<UserData>, Error> {
        self.lock().registry.data(key)
    }

    /// Replaces the user data; the previous value is dropped outside the lock.
    pub(crate) fn set_data(&self, key: ProducerKey<V>, data: Option<UserData>) -> Result<(), Error> {
        let previous = self.lock().registry.set_data(key, data)?;
        drop(previous);
        Ok(())
    }
}
