//! Turns POSIX signals into deliveries.
//!
//! A signal handler may not take locks or allocate, so it never touches a
//! host. It only sets a bit in [`PENDING`] and writes one byte to a self-pipe.
//! A dedicated `sidesync-signal` thread reads the pipe, drains the bits and
//! delivers one item per raised signal through an ordinary producer handle.
//!
//! Only one relay can be installed per process.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use libc::c_int;
use rustix::fs::{OFlags, fcntl_setfl};
use rustix::io::Errno;
use thiserror::Error;

use crate::delivery::DecodeFn;
use crate::error::Error;
use crate::producer::{Api, ProducerHandle};
use crate::registry::Identity;
use crate::trace::{debug, info, trace, warn};

static INSTALLED: AtomicBool = AtomicBool::new(false);
static PENDING: AtomicU64 = AtomicU64::new(0);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Signal numbers that fit the pending bitmask.
const MAX_SIGNAL: c_int = 63;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("a signal relay is already installed")]
    AlreadyInstalled,
    #[error("signal {0} cannot be relayed")]
    InvalidSignal(c_int),
    #[error("failed to create wake pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("failed to install handler for signal {signo}: {source}")]
    Install {
        signo: c_int,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn relay thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("relay producer registration failed: {0}")]
    Register(#[from] Error),
}

const fn signal_bit(signo: c_int) -> Option<u64> {
    if signo >= 1 && signo <= MAX_SIGNAL {
        Some(1 << signo)
    } else {
        None
    }
}

/// Iterates the signal numbers set in `mask`, lowest first.
fn raised(mask: u64) -> impl Iterator<Item = c_int> {
    (1..=MAX_SIGNAL).filter(move |s| signal_bit(*s).is_some_and(|b| mask & b != 0))
}

extern "C" fn on_signal(signo: c_int) {
    if let Some(bit) = signal_bit(signo) {
        PENDING.fetch_or(bit, Ordering::SeqCst);
    }
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        // SAFETY: write(2) is async-signal-safe; a full pipe just drops the
        // byte, the pending bit is already set.
        unsafe {
            libc::write(fd, (&raw const byte).cast(), 1);
        }
    }
}

fn install_handler(signo: c_int) -> io::Result<libc::sigaction> {
    // SAFETY: zeroed sigaction is a valid "no flags, empty mask" value; every
    // field we rely on is set below.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers are valid for the duration of the calls.
    let rc = unsafe {
        libc::sigemptyset(&raw mut action.sa_mask);
        libc::sigaction(signo, &raw const action, &raw mut previous)
    };
    if rc == 0 {
        Ok(previous)
    } else {
        Err(io::Error::last_os_error())
    }
}

fn restore_handlers(previous: &[(c_int, libc::sigaction)]) {
    for (signo, action) in previous.iter().rev() {
        // SAFETY: `action` came from a successful sigaction call.
        unsafe {
            libc::sigaction(*signo, action, std::ptr::null_mut());
        }
    }
}

fn wake(writer: &OwnedFd) {
    match rustix::io::write(writer, &[0]) {
        Ok(_) | Err(Errno::AGAIN) => {}
        Err(_e) => {
            debug!(error = %_e, "signal relay wake failed");
        }
    }
}

/// Releases the process-wide slot if installation fails part way.
struct InstallGuard {
    armed: bool,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        if self.armed {
            WAKE_FD.store(-1, Ordering::SeqCst);
            PENDING.store(0, Ordering::SeqCst);
            INSTALLED.store(false, Ordering::SeqCst);
        }
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    writer: Arc<OwnedFd>,
    thread: Option<JoinHandle<()>>,
    previous: Vec<(c_int, libc::sigaction)>,
}

/// An installed signal relay. Stops on drop.
pub struct SignalRelay {
    running: Option<Running>,
}

impl SignalRelay {
    /// Installs handlers for `signals` and starts relaying them to the host
    /// behind `api`, registered as `identity`.
    ///
    /// Each raised signal becomes one delivery with `decode_factory(signo)` as
    /// its decode callback and the signal number as payload. Signals raised
    /// again before the relay thread catches up are coalesced.
    ///
    /// The producer's cancel callback stops the relay thread; the handlers
    /// stay installed, and keep coalescing, until the relay is stopped or
    /// dropped.
    ///
    /// # Errors
    ///
    /// [`SignalError::AlreadyInstalled`] if another relay is active; otherwise
    /// the step that failed. Nothing stays installed on error.
    pub fn install<V, F>(
        api: &Api<V>,
        identity: Identity,
        signals: &[c_int],
        decode_factory: F,
    ) -> Result<Self, SignalError>
    where
        V: Send + 'static,
        F: Fn(c_int) -> DecodeFn<V> + Send + 'static,
    {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(SignalError::AlreadyInstalled);
        }
        let mut guard = InstallGuard { armed: true };

        if let Some(&bad) = signals.iter().find(|s| signal_bit(**s).is_none()) {
            return Err(SignalError::InvalidSignal(bad));
        }

        let (reader, writer) = rustix::pipe::pipe().map_err(|e| SignalError::Pipe(e.into()))?;
        fcntl_setfl(&writer, OFlags::NONBLOCK).map_err(|e| SignalError::Pipe(e.into()))?;
        let writer = Arc::new(writer);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = Arc::clone(&stop);
            let writer = Arc::clone(&writer);
            api.register(
                identity,
                Some(Box::new(move |h: ProducerHandle<V>| {
                    stop.store(true, Ordering::SeqCst);
                    wake(&writer);
                    let _ = h.unregister();
                })),
                None,
            )?
            .into_handle()
        };

        PENDING.store(0, Ordering::SeqCst);
        WAKE_FD.store(writer.as_raw_fd(), Ordering::SeqCst);

        let mut previous = Vec::with_capacity(signals.len());
        for &signo in signals {
            match install_handler(signo) {
                Ok(old) => previous.push((signo, old)),
                Err(source) => {
                    restore_handlers(&previous);
                    let _ = handle.unregister();
                    return Err(SignalError::Install { signo, source });
                }
            }
        }

        let thread = {
            let stop = Arc::clone(&stop);
            let handle = handle.clone();
            thread::Builder::new()
                .name("sidesync-signal".into())
                .spawn(move || relay_loop(&reader, &stop, &handle, &decode_factory))
        };
        let thread = match thread {
            Ok(t) => t,
            Err(e) => {
                restore_handlers(&previous);
                let _ = handle.unregister();
                return Err(SignalError::Spawn(e));
            }
        };

        guard.armed = false;
        info!(%identity, ?signals, "signal relay installed");
        Ok(Self {
            running: Some(Running {
                stop,
                writer,
                thread: Some(thread),
                previous,
            }),
        })
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Restores the previous handlers, stops the relay thread (which
    /// unregisters its producer) and frees the process-wide slot.
    ///
    /// Idempotent.
    pub fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        restore_handlers(&running.previous);

        running.stop.store(true, Ordering::SeqCst);
        wake(&running.writer);
        if let Some(thread) = running.thread.take()
            && thread.thread().id() != thread::current().id()
        {
            let _ = thread.join();
        }

        WAKE_FD.store(-1, Ordering::SeqCst);
        PENDING.store(0, Ordering::SeqCst);
        INSTALLED.store(false, Ordering::SeqCst);
        info!("signal relay stopped");
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

fn relay_loop<V, F>(reader: &OwnedFd, stop: &AtomicBool, handle: &ProducerHandle<V>, factory: &F)
where
    F: Fn(c_int) -> DecodeFn<V>,
{
    let mut buf = [0u8; 64];
    'relay: loop {
        match rustix::io::read(reader, &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(_e) => {
                warn!(error = %_e, "signal pipe read failed");
                break;
            }
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }

        for signo in raised(PENDING.swap(0, Ordering::SeqCst)) {
            match handle.deliver(Some(factory(signo)), None, Box::new(signo)) {
                Ok(_delivered) => {
                    trace!(signo, depth = _delivered.depth, "signal delivered");
                }
                Err(_e @ (Error::NotStarted | Error::InvalidHandle)) => {
                    debug!(signo, error = %_e, "signal relay producer gone");
                    break 'relay;
                }
                Err(_e) => {
                    warn!(signo, error = %_e, "signal delivery failed");
                }
            }
        }
    }
    let _ = handle.unregister();
    debug!("signal relay thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_cover_valid_signals_only() {
        assert_eq!(signal_bit(0), None);
        assert_eq!(signal_bit(-1), None);
        assert_eq!(signal_bit(64), None);
        assert_eq!(signal_bit(1), Some(2));
        assert_eq!(signal_bit(libc::SIGUSR1), Some(1 << libc::SIGUSR1));
    }

    #[test]
    fn raised_lists_set_bits_in_order() {
        let mask = (1 << libc::SIGTERM) | (1 << libc::SIGINT) | (1 << libc::SIGUSR2);
        let mut expected = vec![libc::SIGINT, libc::SIGTERM, libc::SIGUSR2];
        expected.sort_unstable();
        assert_eq!(raised(mask).collect::<Vec<_>>(), expected);
        assert_eq!(raised(0).count(), 0);
    }
}
