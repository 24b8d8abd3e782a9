//! UDP plumbing for the out-of-band wake-up signal.
//!
//! Notifications only ever travel over loopback, so the endpoint type stays
//! small; the socket wrapper is mio-based so the consumer side can park in a
//! `mio::Poll` until a datagram arrives.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;
