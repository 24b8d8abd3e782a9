//! Error taxonomy and the numeric status codes exposed at the producer boundary.

use std::fmt;

use thiserror::Error;

/// Errors returned by registry, delivery and completion operations.
///
/// `AlreadyRegistered` and `UdpSendFailed` are not errors here: they come back
/// as successful results carrying a warning status (see [`Registered`] and
/// [`Delivered`]).
///
/// [`Registered`]: crate::Registered
/// [`Delivered`]: crate::Delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The host is not in the `Started` state (not started yet, stopping or stopped).
    #[error("host is not started")]
    NotStarted,
    /// The producer handle is no longer registered with this host.
    #[error("producer handle is not registered")]
    InvalidHandle,
    /// The pending reply was already completed, abandoned or cancelled.
    #[error("item was already finalized")]
    InvalidItem,
    /// Registration requires a cancel callback.
    #[error("no cancel callback provided")]
    NoCancelProvided,
    /// Delivery requires a decode callback.
    #[error("no decode callback provided")]
    NoDecodeProvided,
    /// Allocating the queue item or its bookkeeping failed.
    #[error("out of memory")]
    OutOfMemory,
}

impl Error {
    /// Returns the boundary status code for this error.
    #[must_use]
    pub const fn status(self) -> Status {
        match self {
            Self::NotStarted => Status::NotStarted,
            Self::InvalidHandle => Status::InvalidHandle,
            Self::InvalidItem => Status::InvalidItem,
            Self::NoCancelProvided => Status::NoCancelProvided,
            Self::NoDecodeProvided => Status::NoDecodeProvided,
            Self::OutOfMemory => Status::OutOfMemory,
        }
    }
}

/// Status codes of the version-tagged producer API.
///
/// The first seven values keep the historical numbering so that callers
/// written against the numeric table keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = -1,
    InvalidHandle = -2,
    /// Delivered, but the wake-up datagram could not be sent.
    UdpSendFailed = -3,
    NotStarted = -4,
    NoCancelProvided = -5,
    OutOfMemory = -6,
    /// Host state could not be created.
    InitFailed = -7,
    /// Registration returned the producer's existing handle.
    AlreadyRegistered = -8,
    NoDecodeProvided = -9,
    InvalidItem = -10,
}

impl Status {
    /// Returns the raw numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Parses a raw numeric code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::Success,
            -2 => Self::InvalidHandle,
            -3 => Self::UdpSendFailed,
            -4 => Self::NotStarted,
            -5 => Self::NoCancelProvided,
            -6 => Self::OutOfMemory,
            -7 => Self::InitFailed,
            -8 => Self::AlreadyRegistered,
            -9 => Self::NoDecodeProvided,
            -10 => Self::InvalidItem,
            _ => return None,
        })
    }

    /// True for statuses where the requested operation took effect.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(
            self,
            Self::Success | Self::UdpSendFailed | Self::AlreadyRegistered
        )
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        e.status()
    }
}

impl<T: Into<Status>, E: Into<Status>> From<Result<T, E>> for Status {
    fn from(r: Result<T, E>) -> Self {
        match r {
            Ok(v) => v.into(),
            Err(e) => e.into(),
        }
    }
}

impl From<()> for Status {
    fn from((): ()) -> Self {
        Self::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}
