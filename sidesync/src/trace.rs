//! Tracing shim for sidesync.
//!
//! Enable with `--features tracing`. Without the feature the crate's log
//! points compile away, so producers and the consumer loop pay no cost.

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `sidesync=trace`).
///
/// Call once from a binary or from test setup. Does nothing if the
/// `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sidesync=trace"));

    // A second init (e.g. from another test binary thread) is harmless.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, trace, warn};

// Without the feature every log point becomes the unit expression, so a call
// is valid both as a statement and as a match arm.
#[cfg(not(feature = "tracing"))]
macro_rules! log_noop {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {log_noop as debug, log_noop as info, log_noop as trace, log_noop as warn};
