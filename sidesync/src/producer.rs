//! Producer side: the version-tagged function table and per-producer handles.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::API_VERSION;
use crate::delivery::{
    Complete, Decode, DecodeFn, Delivered, Flow, Payload, Reply, ReplyFn, decoder, replier,
};
use crate::error::{Error, Status};
use crate::host::state::Shared;
use crate::registry::{CancelFn, Identity, ProducerKey, UserData};

/// Function table handed to background producers.
///
/// Cheap to clone and safe to share across threads. Operations on a handle
/// that belongs to a different host fail with [`Error::InvalidHandle`].
pub struct Api<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for Api<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> fmt::Debug for Api<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("version", &API_VERSION)
            .field("host", &self.shared.name())
            .finish()
    }
}

impl<V> Api<V> {
    pub(crate) const fn new(shared: Arc<Shared<V>>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub const fn version(&self) -> &'static str {
        API_VERSION
    }

    /// Registers a producer, or returns the live handle already registered
    /// for `identity`.
    ///
    /// # Errors
    ///
    /// [`Error::NotStarted`], [`Error::NoCancelProvided`] or
    /// [`Error::OutOfMemory`].
    pub fn register(
        &self,
        identity: Identity,
        cancel: Option<CancelFn<V>>,
        data: Option<UserData>,
    ) -> Result<Registered<V>, Error> {
        self.shared.register(identity, cancel, data)
    }

    /// Delivers one item; blocks until it is finalized when `reply` is given.
    ///
    /// # Errors
    ///
    /// See [`ProducerHandle::deliver`].
    pub fn deliver(
        &self,
        handle: &ProducerHandle<V>,
        decode: Option<DecodeFn<V>>,
        reply: Option<ReplyFn<V>>,
        payload: Payload,
    ) -> Result<Delivered, Error> {
        self.check(handle)?;
        handle.deliver(decode, reply, payload)
    }

    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if the handle is stale or foreign.
    pub fn unregister(&self, handle: &ProducerHandle<V>) -> Result<(), Error> {
        self.check(handle)?;
        handle.unregister()
    }

    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if the handle is stale or foreign.
    pub fn get_data(&self, handle: &ProducerHandle<V>) -> Result<Option<UserData>, Error> {
        self.check(handle)?;
        handle.data()
    }

    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if the handle is stale or foreign.
    pub fn set_data(
        &self,
        handle: &ProducerHandle<V>,
        data: Option<UserData>,
    ) -> Result<(), Error> {
        self.check(handle)?;
        handle.set_data(data)
    }

    fn check(&self, handle: &ProducerHandle<V>) -> Result<(), Error> {
        if Arc::ptr_eq(&self.shared, &handle.shared) {
            Ok(())
        } else {
            Err(Error::InvalidHandle)
        }
    }
}

/// Result of a successful registration.
#[derive(Debug)]
pub enum Registered<V> {
    New(ProducerHandle<V>),
    /// The identity was already registered; this is its existing handle.
    Existing(ProducerHandle<V>),
}

impl<V> Registered<V> {
    #[must_use]
    pub const fn handle(&self) -> &ProducerHandle<V> {
        match self {
            Self::New(h) | Self::Existing(h) => h,
        }
    }

    #[must_use]
    pub fn into_handle(self) -> ProducerHandle<V> {
        match self {
            Self::New(h) | Self::Existing(h) => h,
        }
    }

    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::New(_) => Status::Success,
            Self::Existing(_) => Status::AlreadyRegistered,
        }
    }
}

impl<V> From<Registered<V>> for Status {
    fn from(r: Registered<V>) -> Self {
        r.status()
    }
}

/// A registered producer.
///
/// Handles are plain references: cloning one does not register anything, and
/// once the producer is unregistered every clone fails with
/// [`Error::InvalidHandle`].
pub struct ProducerHandle<V> {
    shared: Arc<Shared<V>>,
    key: ProducerKey<V>,
    identity: Identity,
}

impl<V> Clone for ProducerHandle<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            key: self.key,
            identity: self.identity,
        }
    }
}

impl<V> PartialEq for ProducerHandle<V> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.key == other.key
    }
}

impl<V> Eq for ProducerHandle<V> {}

impl<V> fmt::Debug for ProducerHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("identity", &self.identity)
            .field("key", &self.key)
            .finish()
    }
}

impl<V> ProducerHandle<V> {
    pub(crate) const fn new(shared: Arc<Shared<V>>, key: ProducerKey<V>, identity: Identity) -> Self {
        Self {
            shared,
            key,
            identity,
        }
    }

    #[must_use]
    pub const fn identity(&self) -> Identity {
        self.identity
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.shared.is_registered(self.key)
    }

    /// Queues an item for the consumer.
    ///
    /// With a `reply` callback this blocks until the consumer completes or
    /// abandons the item, or the item is cancelled. Never call it with a reply
    /// from the consumer thread itself.
    ///
    /// A failed wake-up notification is not an error; it shows up in
    /// [`Delivered::warning`].
    ///
    /// # Errors
    ///
    /// [`Error::NotStarted`], [`Error::InvalidHandle`],
    /// [`Error::NoDecodeProvided`] or [`Error::OutOfMemory`].
    pub fn deliver(
        &self,
        decode: Option<DecodeFn<V>>,
        reply: Option<ReplyFn<V>>,
        payload: Payload,
    ) -> Result<Delivered, Error> {
        let (gate, delivered) = self.shared.push(self.key, decode, reply, payload)?;
        if let Some(gate) = gate {
            gate.wait();
        }
        Ok(delivered)
    }

    /// Fire-and-forget delivery.
    ///
    /// # Errors
    ///
    /// See [`deliver`](Self::deliver).
    pub fn send<F, P>(&self, decode: F, payload: P) -> Result<Delivered, Error>
    where
        F: FnOnce(&mut Decode<'_, V>) -> Flow + Send + 'static,
        P: Any + Send,
    {
        self.deliver(Some(decoder(decode)), None, Box::new(payload))
    }

    /// Blocking delivery with a reply callback.
    ///
    /// # Errors
    ///
    /// See [`deliver`](Self::deliver).
    pub fn call<F, R, P>(&self, decode: F, reply: R, payload: P) -> Result<Delivered, Error>
    where
        F: FnOnce(&mut Decode<'_, V>) -> Flow + Send + 'static,
        R: FnOnce(Complete<'_, V>) + Send + 'static,
        P: Any + Send,
    {
        self.deliver(Some(decoder(decode)), Some(replier(reply)), Box::new(payload))
    }

    /// Unregisters this producer and cancels every item it still owns.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if already unregistered.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from a cancel-mode decode or reply callback, after
    /// all of this producer's items have been finalized.
    pub fn unregister(&self) -> Result<(), Error> {
        self.shared.unregister(self.key)
    }

    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if no longer registered.
    pub fn data(&self) -> Result<Option<UserData>, Error> {
        self.shared.data(self.key)
    }

    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if no longer registered.
    pub fn set_data(&self, data: Option<UserData>) -> Result<(), Error> {
        self.shared.set_data(self.key, data)
    }
}

impl<V: Send + 'static> ProducerHandle<V> {
    /// Round trip that returns the consumer's reply.
    ///
    /// Blocks like [`call`](Self::call). A decode that finishes with
    /// [`Flow::Done`] yields an empty `Completed`; an item cancelled before
    /// decoding yields `Cancelled`.
    ///
    /// # Errors
    ///
    /// See [`deliver`](Self::deliver).
    pub fn request<F, P>(&self, decode: F, payload: P) -> Result<Reply<V>, Error>
    where
        F: FnOnce(&mut Decode<'_, V>) -> Flow + Send + 'static,
        P: Any + Send,
    {
        let slot: Arc<Mutex<Option<Reply<V>>>> = Arc::new(Mutex::new(None));

        let from_decode = Arc::clone(&slot);
        let decode = decoder(move |ctx: &mut Decode<'_, V>| {
            let early = if ctx.is_cancelled() {
                Some((Reply::Cancelled, Flow::Done))
            } else {
                match decode(ctx) {
                    Flow::Done => Some((Reply::Completed(Vec::new()), Flow::Done)),
                    Flow::AwaitReply => None,
                }
            };
            match early {
                Some((reply, flow)) => {
                    *from_decode.lock().unwrap_or_else(PoisonError::into_inner) = Some(reply);
                    flow
                }
                None => Flow::AwaitReply,
            }
        });

        let from_reply = Arc::clone(&slot);
        let reply = replier(move |c: Complete<'_, V>| {
            *from_reply.lock().unwrap_or_else(PoisonError::into_inner) = Some(c.reply);
        });

        self.deliver(Some(decode), Some(reply), Box::new(payload))?;

        let reply = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or(Reply::Abandoned);
        Ok(reply)
    }
}
