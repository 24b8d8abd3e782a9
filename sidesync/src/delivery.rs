//! Push, take, complete and cancel: moving items from producers to the
//! consumer and back.
//!
//! Every transfer between lists happens under the host lock; every user
//! callback runs after the lock is released. An item holds its wait gate
//! until it is dropped, so the gate opens exactly once, after the terminal
//! callback, even if that callback panics.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::host::state::Shared;
use crate::notify::NotifyError;
use crate::queue::{AwaitKey, Awaiting, Queued};
use crate::registry::{Origin, ProducerKey};
use crate::sync::{GateGuard, WaitGate};
use crate::trace::{trace, warn};

/// Opaque per-item data moved from producer to consumer.
pub type Payload = Box<dyn Any + Send>;

/// Runs on the consumer thread when the item is taken, or on the cancelling
/// thread when the item is cancelled before being taken.
pub type DecodeFn<V> = Box<dyn FnOnce(&mut Decode<'_, V>) -> Flow + Send>;

/// Runs once when a decoded item is completed, abandoned or cancelled.
pub type ReplyFn<V> = Box<dyn FnOnce(Complete<'_, V>) + Send>;

/// Boxes a decode closure, pinning down its signature for inference.
pub fn decoder<V, F>(f: F) -> DecodeFn<V>
where
    F: FnOnce(&mut Decode<'_, V>) -> Flow + Send + 'static,
{
    Box::new(f)
}

/// Boxes a reply closure, pinning down its signature for inference.
pub fn replier<V, F>(f: F) -> ReplyFn<V>
where
    F: FnOnce(Complete<'_, V>) + Send + 'static,
{
    Box::new(f)
}

/// What the decode callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Finalize now; the reply callback (if any) is dropped without running.
    Done,
    /// Keep the item until the consumer completes it.
    AwaitReply,
}

/// Context handed to a decode callback.
///
/// Outside cancellation the callback pushes the values the consumer's `poll`
/// returns. During cancellation there is no consumer: pushes are discarded and
/// [`is_cancelled`](Self::is_cancelled) is true.
pub struct Decode<'a, V> {
    outputs: Vec<V>,
    cancelled: bool,
    payload: &'a mut Payload,
    origin: &'a Origin,
}

impl<'a, V> Decode<'a, V> {
    fn new(payload: &'a mut Payload, origin: &'a Origin, cancelled: bool) -> Self {
        Self {
            outputs: Vec::new(),
            cancelled,
            payload,
            origin,
        }
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Adds a value to what `poll` returns. Ignored during cancellation.
    pub fn push(&mut self, value: V) {
        if !self.cancelled {
            self.outputs.push(value);
        }
    }

    #[must_use]
    pub fn payload(&self) -> &(dyn Any + Send) {
        &**self.payload
    }

    /// Mutable access, so decode can leave state behind for the reply.
    pub fn payload_mut(&mut self) -> &mut (dyn Any + Send) {
        &mut **self.payload
    }

    #[must_use]
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    #[must_use]
    pub const fn origin(&self) -> &Origin {
        self.origin
    }

    fn into_outputs(self) -> Vec<V> {
        self.outputs
    }
}

/// How a round trip ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<V> {
    /// The consumer completed the item with these values.
    Completed(Vec<V>),
    /// The consumer dropped or explicitly abandoned the item.
    Abandoned,
    /// The owning producer unregistered (or the host shut down) first.
    Cancelled,
}

impl<V> Reply<V> {
    /// True unless the consumer completed the item.
    #[must_use]
    pub const fn is_abandoned(&self) -> bool {
        !matches!(self, Self::Completed(_))
    }
}

/// Argument of a reply callback.
pub struct Complete<'a, V> {
    pub reply: Reply<V>,
    pub payload: Payload,
    pub origin: &'a Origin,
}

impl<V> Complete<'_, V> {
    #[must_use]
    pub const fn is_abandoned(&self) -> bool {
        self.reply.is_abandoned()
    }
}

/// Result of a successful push.
#[derive(Debug)]
pub struct Delivered {
    /// Queue depth right after the push.
    pub depth: usize,
    /// Set when the wake-up datagram could not be sent. Delivery still
    /// succeeded.
    pub warning: Option<NotifyError>,
}

impl Delivered {
    #[must_use]
    pub const fn status(&self) -> crate::Status {
        if self.warning.is_some() {
            crate::Status::UdpSendFailed
        } else {
            crate::Status::Success
        }
    }
}

impl From<Delivered> for crate::Status {
    fn from(d: Delivered) -> Self {
        d.status()
    }
}

/// Outcome of one consumer `poll`.
pub enum Polled<V> {
    Empty,
    Ready(Taken<V>),
}

impl<V> Polled<V> {
    /// Queue depth after the take, or -1 when the queue was empty.
    #[must_use]
    pub fn depth(&self) -> isize {
        match self {
            Self::Empty => -1,
            Self::Ready(t) => isize::try_from(t.depth).unwrap_or(isize::MAX),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl<V> fmt::Debug for Polled<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Ready(t) => f
                .debug_struct("Ready")
                .field("depth", &t.depth)
                .field("outputs", &t.outputs.len())
                .field("pending", &t.pending.is_some())
                .finish(),
        }
    }
}

/// An item the consumer just decoded.
pub struct Taken<V> {
    /// Queue depth after the take.
    pub depth: usize,
    /// Values pushed by the decode callback.
    pub outputs: Vec<V>,
    /// Present when the item awaits a reply.
    pub pending: Option<PendingReply<V>>,
}

/// Consumer-side reference to an item awaiting its reply.
///
/// Dropping it without calling [`complete`](Self::complete) abandons the item.
pub struct PendingReply<V> {
    shared: Arc<Shared<V>>,
    key: AwaitKey<V>,
    finalized: bool,
}

impl<V> PendingReply<V> {
    /// Runs the reply callback with `values` and releases the producer.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidItem`] if this reference was already finalized, or the
    /// item was cancelled by its producer in the meantime.
    pub fn complete(&mut self, values: Vec<V>) -> Result<(), Error> {
        self.finish(Reply::Completed(values))
    }

    /// Runs the reply callback as abandoned.
    ///
    /// # Errors
    ///
    /// Same as [`complete`](Self::complete).
    pub fn abandon(&mut self) -> Result<(), Error> {
        self.finish(Reply::Abandoned)
    }

    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn finish(&mut self, reply: Reply<V>) -> Result<(), Error> {
        if self.finalized {
            return Err(Error::InvalidItem);
        }
        self.finalized = true;
        self.shared.finish(self.key, reply)
    }
}

impl<V> Drop for PendingReply<V> {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.finish(Reply::Abandoned);
        }
    }
}

impl<V> fmt::Debug for PendingReply<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("key", &self.key)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl<V> Queued<V> {
    /// Finalizes an item that was never taken: decode runs in cancellation
    /// mode, the reply callback is dropped, the gate opens.
    pub(crate) fn cancel(self, origin: &Origin) {
        let Self {
            decode,
            mut payload,
            gate: _gate,
            ..
        } = self;
        let mut ctx = Decode::new(&mut payload, origin, true);
        let _ = decode(&mut ctx);
    }
}

impl<V> Awaiting<V> {
    fn finish(self, reply: Reply<V>) {
        let Self {
            reply: reply_fn,
            payload,
            gate: _gate,
            origin,
            ..
        } = self;
        reply_fn(Complete {
            reply,
            payload,
            origin: &origin,
        });
    }

    pub(crate) fn cancel(self) {
        self.finish(Reply::Cancelled);
    }
}

impl<V> Shared<V> {
    /// Appends an item and sends the wake-up notification.
    ///
    /// Returns the item's gate (present iff a reply callback was given) for
    /// the caller to wait on after this returns and the lock is released.
    pub(crate) fn push(
        &self,
        owner: ProducerKey<V>,
        decode: Option<DecodeFn<V>>,
        reply: Option<ReplyFn<V>>,
        payload: Payload,
    ) -> Result<(Option<Arc<WaitGate>>, Delivered), Error> {
        let mut state = self.lock();
        if !state.is_started() {
            return Err(Error::NotStarted);
        }
        let Some(identity) = state.registry.identity(owner) else {
            return Err(Error::InvalidHandle);
        };
        let Some(decode) = decode else {
            return Err(Error::NoDecodeProvided);
        };

        let gate = reply.is_some().then(|| Arc::new(WaitGate::new()));
        let depth = state.queue.push(Queued {
            owner,
            identity,
            decode,
            reply,
            payload,
            gate: GateGuard::new(gate.clone()),
        })?;
        trace!(host = %self.name(), %identity, depth, round_trip = gate.is_some(), "item pushed");

        let warning = state.notify.notify(depth).err();
        if let Some(_e) = &warning {
            warn!(host = %self.name(), depth, error = %_e, "wake-up notification failed");
        }
        Ok((gate, Delivered { depth, warning }))
    }

    /// Pops the oldest item and decodes it on the calling thread.
    pub(crate) fn take(self: &Arc<Self>) -> Polled<V> {
        let (item, depth, origin) = {
            let mut state = self.lock();
            let Some(item) = state.queue.pop() else {
                return Polled::Empty;
            };
            let depth = state.queue.len();
            // Items are detached together with their owner, so the owner is
            // always still registered here.
            let origin = state
                .registry
                .origin(item.owner)
                .unwrap_or_else(|| Origin::new(item.identity, None));
            (item, depth, origin)
        };

        let Queued {
            owner,
            decode,
            reply,
            mut payload,
            gate,
            ..
        } = item;

        let mut ctx = Decode::new(&mut payload, &origin, false);
        let flow = decode(&mut ctx);
        let outputs = ctx.into_outputs();
        trace!(host = %self.name(), depth, outputs = outputs.len(), ?flow, "item taken");

        let reply = match (reply, flow) {
            (Some(reply), Flow::AwaitReply) => reply,
            // Dropping `gate` opens it.
            _ => {
                return Polled::Ready(Taken {
                    depth,
                    outputs,
                    pending: None,
                });
            }
        };

        let parked = Awaiting {
            owner,
            reply,
            payload,
            gate,
            origin,
        };
        let parked = {
            let mut state = self.lock();
            if state.registry.validate(owner) {
                state.queue.park(parked)
            } else {
                // Owner unregistered while decode ran.
                Err(parked)
            }
        };

        let pending = match parked {
            Ok(key) => Some(PendingReply {
                shared: Arc::clone(self),
                key,
                finalized: false,
            }),
            Err(item) => {
                item.cancel();
                None
            }
        };
        Polled::Ready(Taken {
            depth,
            outputs,
            pending,
        })
    }

    fn finish(&self, key: AwaitKey<V>, reply: Reply<V>) -> Result<(), Error> {
        let item = self.lock().queue.unpark(key).ok_or(Error::InvalidItem)?;
        trace!(host = %self.name(), abandoned = reply.is_abandoned(), "item completed");
        item.finish(reply);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, HostConfig};
    use crate::registry::Identity;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn host() -> Host<u32> {
        Host::start(HostConfig::default())
    }

    #[test]
    fn decode_sees_payload_and_origin() {
        let host = host();
        let handle = host
            .api()
            .register(Identity::new(7), Some(Box::new(|_| {})), None)
            .unwrap()
            .into_handle();
        handle
            .send(
                |ctx: &mut Decode<'_, u32>| {
                    let v = *ctx.payload_as::<u32>().unwrap();
                    assert_eq!(ctx.origin().identity(), Identity::new(7));
                    ctx.push(v * 2);
                    Flow::Done
                },
                21u32,
            )
            .unwrap();

        let Polled::Ready(taken) = host.poll() else {
            panic!("expected an item");
        };
        assert_eq!(taken.outputs, vec![42]);
        assert_eq!(taken.depth, 0);
        assert!(taken.pending.is_none());
        assert!(host.poll().is_empty());
        assert_eq!(host.poll().depth(), -1);
    }

    #[test]
    fn cancelled_decode_discards_pushes() {
        let mut payload: Payload = Box::new(());
        let origin = Origin::new(Identity::new(1), None);
        let mut ctx = Decode::<u32>::new(&mut payload, &origin, true);
        assert!(ctx.is_cancelled());
        ctx.push(1);
        assert!(ctx.into_outputs().is_empty());
    }

    #[test]
    fn owner_unregistered_during_decode_gets_cancelled_reply() {
        let host = host();
        let handle = host
            .api()
            .register(Identity::new(1), Some(Box::new(|_| {})), None)
            .unwrap()
            .into_handle();
        let own = handle.clone();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);

        let producer = std::thread::spawn(move || {
            handle
                .call(
                    move |_: &mut Decode<'_, u32>| {
                        own.unregister().unwrap();
                        Flow::AwaitReply
                    },
                    move |c: Complete<'_, u32>| {
                        *s.lock().unwrap() = Some(c.reply);
                    },
                    (),
                )
                .unwrap()
        });

        let taken = loop {
            if let Polled::Ready(t) = host.poll() {
                break t;
            }
            std::thread::yield_now();
        };
        assert!(taken.pending.is_none());
        producer.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(Reply::Cancelled));
        assert_eq!(host.pending_count(), 0);
        assert_eq!(host.producer_count(), 0);
    }

    #[test]
    fn completing_twice_is_invalid_item() {
        let host = host();
        let handle = host
            .api()
            .register(Identity::new(1), Some(Box::new(|_| {})), None)
            .unwrap()
            .into_handle();
        let replies = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&replies);

        let producer = std::thread::spawn(move || {
            handle
                .call(
                    |_: &mut Decode<'_, u32>| Flow::AwaitReply,
                    move |c: Complete<'_, u32>| {
                        assert_eq!(c.reply, Reply::Completed(vec![1]));
                        r.fetch_add(1, Ordering::SeqCst);
                    },
                    (),
                )
                .unwrap()
        });

        let mut pending = loop {
            if let Polled::Ready(t) = host.poll() {
                break t.pending.unwrap();
            }
            std::thread::yield_now();
        };
        assert_eq!(host.pending_count(), 1);
        pending.complete(vec![1]).unwrap();
        assert_eq!(pending.complete(vec![2]), Err(Error::InvalidItem));
        assert_eq!(pending.abandon(), Err(Error::InvalidItem));
        drop(pending);

        producer.join().unwrap();
        assert_eq!(replies.load(Ordering::SeqCst), 1);
        assert_eq!(host.pending_count(), 0);
    }

    #[test]
    fn dropping_pending_reply_abandons() {
        let host = host();
        let handle = host
            .api()
            .register(Identity::new(1), Some(Box::new(|_| {})), None)
            .unwrap()
            .into_handle();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);

        let producer = std::thread::spawn(move || {
            handle
                .call(
                    |_: &mut Decode<'_, u32>| Flow::AwaitReply,
                    move |c: Complete<'_, u32>| {
                        *s.lock().unwrap() = Some(c.reply);
                    },
                    (),
                )
                .unwrap()
        });

        loop {
            if let Polled::Ready(t) = host.poll() {
                // Dropped here without completion.
                assert!(t.pending.is_some());
                break;
            }
            std::thread::yield_now();
        }
        producer.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(Reply::Abandoned));
    }

    #[test]
    fn done_flow_skips_reply_and_releases_producer() {
        let host = host();
        let handle = host
            .api()
            .register(Identity::new(1), Some(Box::new(|_| {})), None)
            .unwrap()
            .into_handle();
        let replied = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&replied);

        let producer = std::thread::spawn(move || {
            handle
                .call(
                    |ctx: &mut Decode<'_, u32>| {
                        ctx.push(9);
                        Flow::Done
                    },
                    move |_: Complete<'_, u32>| {
                        r.fetch_add(1, Ordering::SeqCst);
                    },
                    (),
                )
                .unwrap()
        });

        let taken = loop {
            if let Polled::Ready(t) = host.poll() {
                break t;
            }
            std::thread::yield_now();
        };
        assert_eq!(taken.outputs, vec![9]);
        assert!(taken.pending.is_none());
        producer.join().unwrap();
        assert_eq!(replied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_decode_still_releases_producer() {
        let host = host();
        let handle = host
            .api()
            .register(Identity::new(1), Some(Box::new(|_| {})), None)
            .unwrap()
            .into_handle();

        let producer = std::thread::spawn(move || {
            handle.call(
                |_: &mut Decode<'_, u32>| -> Flow { panic!("decode failed") },
                |_: Complete<'_, u32>| {},
                (),
            )
        });

        loop {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| host.poll()));
            match result {
                Err(_) => break,
                Ok(p) if p.is_empty() => std::thread::yield_now(),
                Ok(_) => panic!("decode should have panicked"),
            }
        }
        assert!(producer.join().unwrap().is_ok());
        assert_eq!(host.queue_size(), 0);
    }
}
