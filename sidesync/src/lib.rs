//! Thread-safe hand-off from background producer threads to one serialized
//! consumer loop.
//!
//! Producers register with a [`Host`] through its [`Api`] and deliver items
//! carrying a decode callback and an opaque payload. The consumer drains the
//! queue with [`Host::poll`], which runs each decode callback on the consumer
//! thread. A producer may also ask for a round trip: it blocks until the
//! consumer completes the item through its [`PendingReply`].

pub mod delivery;
pub mod error;
pub mod host;
pub mod net;
pub mod notify;
pub mod producer;
mod queue;
pub mod registry;
#[cfg(unix)]
pub mod signal;
mod slab;
pub mod sync;
mod trace;

pub use delivery::{
    Complete, Decode, DecodeFn, Delivered, Flow, Payload, PendingReply, Polled, Reply, ReplyFn,
    Taken, decoder, replier,
};
pub use error::{Error, Status};
pub use host::{Host, HostConfig, HostSlot, HostStatus};
pub use notify::{Listener, NotifyError};
pub use producer::{Api, ProducerHandle, Registered};
pub use registry::{CancelFn, Identity, Origin, UserData};
#[cfg(unix)]
pub use signal::{SignalError, SignalRelay};
pub use sync::{Timeout, WaitGate};
pub use trace::init_tracing;

/// Version tag of the producer function table.
pub const API_VERSION: &str = "1.0";
