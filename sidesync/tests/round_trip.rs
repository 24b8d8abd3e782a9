//! End-to-end tests for the producer → consumer → producer flow.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=sidesync=trace cargo test --features tracing --test round_trip -- --nocapture
//! ```

use std::collections::HashMap;
use std::io;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use sidesync::notify::{NotifySink, SinkFactory};
use sidesync::{
    CancelFn, Complete, Decode, Error, Flow, Host, HostConfig, HostStatus, Identity, Listener,
    Polled, Reply, Status, Timeout,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        sidesync::init_tracing();
    });
}

fn noop_cancel<V: 'static>() -> Option<CancelFn<V>> {
    Some(Box::new(|_| {}))
}

/// Polls until an item is taken, yielding in between.
fn poll_ready<V>(host: &Host<V>) -> sidesync::Taken<V> {
    for _ in 0..100_000 {
        if let Polled::Ready(taken) = host.poll() {
            return taken;
        }
        thread::yield_now();
    }
    panic!("no item arrived");
}

#[test]
fn fifo_across_producer_threads() {
    init_test_tracing();
    const PRODUCERS: usize = 4;
    const ITEMS: usize = 250;

    let host: Host<(usize, usize)> = Host::start(HostConfig::default());
    let api = host.api();

    let threads: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let handle = api
                .register(Identity::new(p + 1), noop_cancel(), None)
                .unwrap()
                .into_handle();
            thread::spawn(move || {
                for seq in 0..ITEMS {
                    handle
                        .send(
                            |ctx: &mut Decode<'_, (usize, usize)>| {
                                let item = *ctx.payload_as::<(usize, usize)>().unwrap();
                                ctx.push(item);
                                Flow::Done
                            },
                            (p, seq),
                        )
                        .unwrap();
                }
            })
        })
        .collect();

    let mut last_seen: HashMap<usize, usize> = HashMap::new();
    let mut taken = 0;
    while taken < PRODUCERS * ITEMS {
        match host.poll() {
            Polled::Ready(t) => {
                for (p, seq) in t.outputs {
                    if let Some(prev) = last_seen.insert(p, seq) {
                        assert!(seq > prev, "producer {p}: {seq} after {prev}");
                    } else {
                        assert_eq!(seq, 0);
                    }
                    taken += 1;
                }
            }
            Polled::Empty => thread::yield_now(),
        }
    }

    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(host.queue_size(), 0);
    assert!(last_seen.values().all(|&seq| seq == ITEMS - 1));
}

#[test]
fn round_trip_returns_reply_to_blocked_producer() {
    init_test_tracing();
    let host: Host<String> = Host::start(HostConfig::default());
    let handle = host
        .api()
        .register(Identity::new(1), noop_cancel(), None)
        .unwrap()
        .into_handle();

    let reply_seen = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&reply_seen);
    let producer = thread::spawn(move || {
        handle.call(
            |ctx: &mut Decode<'_, String>| {
                let n = *ctx.payload_as::<i32>().unwrap();
                ctx.push(n.to_string());
                Flow::AwaitReply
            },
            move |c: Complete<'_, String>| {
                assert_eq!(c.payload.downcast_ref::<i32>(), Some(&42));
                *seen.lock().unwrap() = Some(c.reply);
            },
            42i32,
        )
    });

    let taken = poll_ready(&host);
    assert_eq!(taken.outputs, vec!["42".to_string()]);
    let mut pending = taken.pending.expect("round trip keeps the item");
    assert!(!producer.is_finished());

    pending.complete(vec!["ok".to_string()]).unwrap();
    let delivered = producer.join().unwrap().unwrap();
    assert_eq!(delivered.status(), Status::Success);
    assert_eq!(
        *reply_seen.lock().unwrap(),
        Some(Reply::Completed(vec!["ok".to_string()]))
    );
    assert_eq!(host.pending_count(), 0);
}

#[test]
fn unregister_cancels_queued_and_blocked_items() {
    init_test_tracing();
    let host: Host<()> = Host::start(HostConfig::default());
    let handle = host
        .api()
        .register(Identity::new(1), noop_cancel(), None)
        .unwrap()
        .into_handle();

    let cancelled = Arc::new(AtomicUsize::new(0));
    let decode = |counter: &Arc<AtomicUsize>| {
        let counter = Arc::clone(counter);
        move |ctx: &mut Decode<'_, ()>| {
            assert!(ctx.is_cancelled());
            counter.fetch_add(1, Ordering::SeqCst);
            Flow::Done
        }
    };

    handle.send(decode(&cancelled), ()).unwrap();
    handle.send(decode(&cancelled), ()).unwrap();

    let blocked = {
        let handle = handle.clone();
        let d = decode(&cancelled);
        thread::spawn(move || handle.call(d, |_: Complete<'_, ()>| panic!("reply must not run"), ()))
    };
    while host.queue_size() < 3 {
        thread::yield_now();
    }

    handle.unregister().unwrap();

    assert!(blocked.join().unwrap().is_ok());
    assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    assert_eq!(host.queue_size(), 0);
    assert!(host.poll().is_empty());
}

#[test]
fn unregister_cancels_item_awaiting_reply() {
    init_test_tracing();
    let host: Host<()> = Host::start(HostConfig::default());
    let handle = host
        .api()
        .register(Identity::new(1), noop_cancel(), None)
        .unwrap()
        .into_handle();

    let requester = {
        let handle = handle.clone();
        thread::spawn(move || handle.request(|_| Flow::AwaitReply, ()))
    };

    let mut pending = poll_ready(&host).pending.unwrap();
    assert_eq!(host.pending_count(), 1);
    handle.unregister().unwrap();

    assert_eq!(requester.join().unwrap(), Ok(Reply::Cancelled));
    assert_eq!(host.pending_count(), 0);
    // The consumer's late completion finds nothing left to complete.
    assert_eq!(pending.complete(Vec::new()), Err(Error::InvalidItem));
}

#[test]
fn shutdown_unblocks_producers_and_refuses_new_work() {
    init_test_tracing();
    let host: Host<()> = Host::start(HostConfig::default());
    let api = host.api();
    let handle = api
        .register(
            Identity::new(1),
            Some(Box::new(|h: sidesync::ProducerHandle<()>| {
                h.unregister().unwrap();
            })),
            None,
        )
        .unwrap()
        .into_handle();

    let requester = {
        let handle = handle.clone();
        thread::spawn(move || handle.request(|_| Flow::AwaitReply, ()))
    };
    while host.queue_size() == 0 {
        thread::yield_now();
    }

    host.shutdown();
    assert_eq!(requester.join().unwrap(), Ok(Reply::Cancelled));
    assert_eq!(host.status(), HostStatus::Stopped);
    assert_eq!(host.producer_count(), 0);

    assert_eq!(
        api.register(Identity::new(2), noop_cancel(), None).err(),
        Some(Error::NotStarted)
    );
    assert_eq!(
        handle.send(|_| Flow::Done, ()).err(),
        Some(Error::NotStarted)
    );
}

#[test]
fn panicking_cancel_decode_still_releases_every_producer() {
    init_test_tracing();
    let host: Host<()> = Host::start(HostConfig::default());
    let handle = host
        .api()
        .register(Identity::new(1), noop_cancel(), None)
        .unwrap()
        .into_handle();
    let cancelled = Arc::new(AtomicUsize::new(0));

    let first = {
        let handle = handle.clone();
        thread::spawn(move || {
            handle.call(
                |ctx: &mut Decode<'_, ()>| -> Flow {
                    if ctx.is_cancelled() {
                        panic!("cancel decode failed");
                    }
                    Flow::AwaitReply
                },
                |_: Complete<'_, ()>| {},
                (),
            )
        })
    };
    while host.queue_size() < 1 {
        thread::yield_now();
    }
    let second = {
        let handle = handle.clone();
        let counter = Arc::clone(&cancelled);
        thread::spawn(move || {
            handle.call(
                move |ctx: &mut Decode<'_, ()>| {
                    if ctx.is_cancelled() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Flow::AwaitReply
                },
                |_: Complete<'_, ()>| {},
                (),
            )
        })
    };
    while host.queue_size() < 2 {
        thread::yield_now();
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle.unregister()));
    assert!(result.is_err());

    // Both producers are released and the second item was still cancelled.
    assert!(first.join().unwrap().is_ok());
    assert!(second.join().unwrap().is_ok());
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    assert!(!handle.is_registered());
    assert_eq!(host.queue_size(), 0);
}

#[test]
fn panicking_cancel_callback_still_stops_host() {
    init_test_tracing();
    let host: Host<()> = Host::start(HostConfig::default());
    let api = host.api();
    let older_cancelled = Arc::new(AtomicUsize::new(0));
    {
        let older_cancelled = Arc::clone(&older_cancelled);
        api.register(
            Identity::new(1),
            Some(Box::new(move |h: sidesync::ProducerHandle<()>| {
                older_cancelled.fetch_add(1, Ordering::SeqCst);
                h.unregister().unwrap();
            })),
            None,
        )
        .unwrap();
    }
    let newer = api
        .register(
            Identity::new(2),
            Some(Box::new(|_: sidesync::ProducerHandle<()>| {
                panic!("cancel callback failed");
            })),
            None,
        )
        .unwrap()
        .into_handle();

    let requester = {
        let handle = newer.clone();
        thread::spawn(move || handle.request(|_| Flow::AwaitReply, ()))
    };
    while host.queue_size() == 0 {
        thread::yield_now();
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| host.shutdown()));
    assert!(result.is_err());

    assert_eq!(host.status(), HostStatus::Stopped);
    assert_eq!(host.producer_count(), 0);
    assert_eq!(older_cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(requester.join().unwrap(), Ok(Reply::Cancelled));
    // Already stopped: a second shutdown does not panic again.
    host.shutdown();
}

#[test]
fn duplicate_registration_returns_same_handle() {
    init_test_tracing();
    let host: Host<()> = Host::start(HostConfig::default());
    let api = host.api();
    let first = api.register(Identity::new(3), noop_cancel(), None).unwrap();
    let again = api.register(Identity::new(3), noop_cancel(), None).unwrap();

    assert_eq!(first.status(), Status::Success);
    assert_eq!(again.status(), Status::AlreadyRegistered);
    assert!(again.status().is_ok());
    assert_eq!(first.handle(), again.handle());
    assert_eq!(host.producer_count(), 1);
}

/// Sinks that fail the first `failures` sends, shared across reopens.
struct FlakyFactory {
    failures: Arc<AtomicUsize>,
}

struct FlakySink {
    failures: Arc<AtomicUsize>,
}

impl NotifySink for FlakySink {
    fn send(&mut self, _payload: &[u8]) -> io::Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            Err(io::Error::other("flaky sink"))
        } else {
            Ok(())
        }
    }
}

impl SinkFactory for FlakyFactory {
    fn open(&self, _port: NonZeroU16) -> io::Result<Box<dyn NotifySink>> {
        Ok(Box::new(FlakySink {
            failures: Arc::clone(&self.failures),
        }))
    }
}

#[test]
fn notification_failure_does_not_lose_the_item() {
    init_test_tracing();
    let failures = Arc::new(AtomicUsize::new(0));
    let host: Host<()> = Host::start(HostConfig {
        notification_port: 9,
        sink_factory: Arc::new(FlakyFactory {
            failures: Arc::clone(&failures),
        }),
        ..HostConfig::default()
    });
    let handle = host
        .api()
        .register(Identity::new(1), noop_cancel(), None)
        .unwrap()
        .into_handle();

    // One failure: recovered by the single reopen-and-retry.
    failures.store(1, Ordering::SeqCst);
    let delivered = handle.send(|_| Flow::Done, ()).unwrap();
    assert_eq!(delivered.status(), Status::Success);

    // Two failures: reported as a warning, item still queued.
    failures.store(2, Ordering::SeqCst);
    let delivered = handle.send(|_| Flow::Done, ()).unwrap();
    assert_eq!(delivered.status(), Status::UdpSendFailed);
    assert!(delivered.warning.is_some());
    assert_eq!(delivered.depth, 2);
    assert_eq!(host.queue_size(), 2);
}

#[test]
fn listener_wakes_on_delivery() {
    init_test_tracing();
    let host: Host<()> = Host::start(HostConfig::default());
    let mut listener = Listener::bind(0).unwrap();
    host.set_notification_port(listener.port()).unwrap();
    assert_eq!(host.notification_port(), listener.port());

    let handle = host
        .api()
        .register(Identity::new(1), noop_cancel(), None)
        .unwrap()
        .into_handle();
    handle.send(|_| Flow::Done, ()).unwrap();

    let depth = listener
        .wait(Timeout::Duration(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(depth, Some(1));

    host.set_notification_port(0).unwrap();
    assert_eq!(host.notification_port(), 0);
}
