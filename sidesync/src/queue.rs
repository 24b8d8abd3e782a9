//! The two item lists behind a host: the FIFO of undecoded items and the set
//! of decoded items awaiting the consumer's reply.
//!
//! An item is owned by exactly one place at a time. `pop` hands it to the
//! consumer by value; `park` takes it back into the awaiting set; `unpark`
//! and `detach_owner` hand it out again for finalization. Each item owns its
//! producer's gate, so dropping an item opens it.

use std::collections::VecDeque;
use std::mem;

use crate::delivery::{DecodeFn, Payload, ReplyFn};
use crate::error::Error;
use crate::registry::{Identity, Origin, ProducerKey};
use crate::slab::{Key, Slab};
use crate::sync::GateGuard;

/// An item waiting to be decoded.
pub(crate) struct Queued<V> {
    pub(crate) owner: ProducerKey<V>,
    pub(crate) identity: Identity,
    pub(crate) decode: DecodeFn<V>,
    pub(crate) reply: Option<ReplyFn<V>>,
    pub(crate) payload: Payload,
    pub(crate) gate: GateGuard,
}

/// A decoded item whose reply callback has not run yet.
pub(crate) struct Awaiting<V> {
    pub(crate) owner: ProducerKey<V>,
    pub(crate) reply: ReplyFn<V>,
    pub(crate) payload: Payload,
    pub(crate) gate: GateGuard,
    pub(crate) origin: Origin,
}

pub(crate) type AwaitKey<V> = Key<Awaiting<V>>;

pub(crate) struct DeliveryQueue<V> {
    queued: VecDeque<Queued<V>>,
    awaiting: Slab<Awaiting<V>>,
}

impl<V> DeliveryQueue<V> {
    pub(crate) const fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            awaiting: Slab::new(),
        }
    }

    /// Appends at the tail and returns the new depth.
    pub(crate) fn push(&mut self, item: Queued<V>) -> Result<usize, Error> {
        self.queued
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.queued.push_back(item);
        Ok(self.queued.len())
    }

    pub(crate) fn pop(&mut self) -> Option<Queued<V>> {
        self.queued.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.len()
    }

    pub(crate) const fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    /// Moves a decoded item into the awaiting set, or hands it back if no
    /// slot could be allocated.
    pub(crate) fn park(&mut self, item: Awaiting<V>) -> Result<AwaitKey<V>, Awaiting<V>> {
        self.awaiting.try_insert(item)
    }

    pub(crate) fn unpark(&mut self, key: AwaitKey<V>) -> Option<Awaiting<V>> {
        self.awaiting.remove(key)
    }

    /// Removes every item owned by `owner` from both lists. Queued items keep
    /// their FIFO order.
    pub(crate) fn detach_owner(
        &mut self,
        owner: ProducerKey<V>,
    ) -> (Vec<Queued<V>>, Vec<Awaiting<V>>) {
        let (mine, rest): (VecDeque<_>, VecDeque<_>) = mem::take(&mut self.queued)
            .into_iter()
            .partition(|item| item.owner == owner);
        self.queued = rest;
        let awaiting = self.awaiting.extract_if(|item| item.owner == owner);
        (mine.into(), awaiting)
    }
}
