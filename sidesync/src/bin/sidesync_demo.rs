//! sidesync demo daemon.
//!
//! Starts a host, spawns a few producer threads that deliver items (every Nth
//! one as a blocking round trip) and drains them on the main thread, parking
//! on the UDP wake-up listener between bursts.
//!
//! # Usage
//!
//! ```sh
//! sidesync-demo --producers 4 --items 1000 --round-trip-every 10
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: relayed through the host, then graceful shutdown

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sidesync::{
    Error, Flow, Host, HostConfig, Identity, Listener, NotifyError, Polled, ProducerHandle,
    Reply, Timeout,
};

/// Default number of producer threads.
const DEFAULT_PRODUCERS: usize = 4;

/// Default number of items per producer.
const DEFAULT_ITEMS: usize = 100;

/// Default round-trip interval (0 disables round trips).
const DEFAULT_ROUND_TRIP_EVERY: usize = 10;

/// How long the consumer parks on the listener between polls.
const WAIT: Duration = Duration::from_millis(100);

/// Set once SIGINT/SIGTERM has been relayed to the consumer.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("{0}")]
    Args(String),
    #[error("listener: {0}")]
    Io(#[from] io::Error),
    #[error("notification: {0}")]
    Notify(#[from] NotifyError),
    #[error("delivery: {0}")]
    Delivery(#[from] Error),
    #[cfg(unix)]
    #[error("signal relay: {0}")]
    Signal(#[from] sidesync::SignalError),
}

struct DemoConfig {
    port: u16,
    producers: usize,
    items: usize,
    round_trip_every: usize,
}

#[derive(Default)]
struct Totals {
    taken: usize,
    outputs: usize,
    replies: usize,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("sidesync-demo: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), DemoError> {
    let args: Vec<String> = std::env::args().collect();
    let config = parse_args(&args)?;
    sidesync::init_tracing();

    let host: Host<String> = Host::start(HostConfig {
        name: "sidesync-demo".into(),
        ..HostConfig::default()
    });
    let mut listener = Listener::bind(config.port)?;
    host.set_notification_port(listener.port())?;

    eprintln!(
        "sidesync-demo: {} producer(s) x {} item(s), notifications on port {}",
        config.producers,
        config.items,
        listener.port()
    );

    #[cfg(unix)]
    let mut relay = install_signal_relay(&host)?;

    let api = host.api();
    let mut producers = Vec::with_capacity(config.producers);
    for index in 0..config.producers {
        let registered = api.register(
            Identity::new(index + 1),
            Some(Box::new(|h: ProducerHandle<String>| {
                let _ = h.unregister();
            })),
            None,
        )?;
        let handle = registered.into_handle();
        let items = config.items;
        let every = config.round_trip_every;
        let thread = thread::Builder::new()
            .name(format!("producer-{index}"))
            .spawn(move || produce(&handle, items, every))?;
        producers.push(thread);
    }

    eprintln!("sidesync-demo: ready");

    let totals = consume(&host, &mut listener, &producers)?;

    if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        eprintln!("\nsidesync-demo: received shutdown signal");
    }
    eprintln!("sidesync-demo: shutting down...");
    host.shutdown();

    let mut delivered = 0;
    for thread in producers {
        delivered += thread.join().unwrap_or(0);
    }
    #[cfg(unix)]
    relay.stop();

    eprintln!(
        "sidesync-demo: delivered {delivered}, taken {}, outputs {}, replies {}",
        totals.taken, totals.outputs, totals.replies
    );
    eprintln!("sidesync-demo: stopped");
    Ok(())
}

#[cfg(unix)]
fn install_signal_relay(host: &Host<String>) -> Result<sidesync::SignalRelay, DemoError> {
    static ANCHOR: u8 = 0;
    let relay = sidesync::SignalRelay::install(
        &host.api(),
        Identity::of(&ANCHOR),
        &[libc::SIGINT, libc::SIGTERM],
        |signo| {
            sidesync::decoder(move |ctx| {
                if !ctx.is_cancelled() {
                    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
                    ctx.push(format!("signal {signo}"));
                }
                Flow::Done
            })
        },
    )?;
    Ok(relay)
}

/// Producer thread body. Returns the number of items accepted by the host.
fn produce(handle: &ProducerHandle<String>, items: usize, every: usize) -> usize {
    let id = handle.identity();
    let mut delivered = 0;
    for n in 0..items {
        let result = if every > 0 && n % every == every - 1 {
            handle
                .request(
                    move |ctx| {
                        ctx.push(format!("{id} request {n}"));
                        Flow::AwaitReply
                    },
                    n,
                )
                .map(|reply| {
                    if let Reply::Completed(values) = reply
                        && values.first().map(String::as_str) != Some("ok")
                    {
                        eprintln!("sidesync-demo: {id} unexpected reply {values:?}");
                    }
                })
        } else {
            handle
                .send(
                    move |ctx| {
                        let n = ctx.payload_as::<usize>().copied().unwrap_or_default();
                        ctx.push(format!("{id} item {n}"));
                        Flow::Done
                    },
                    n,
                )
                .map(|_| ())
        };
        match result {
            Ok(()) => delivered += 1,
            Err(Error::NotStarted | Error::InvalidHandle) => break,
            Err(e) => eprintln!("sidesync-demo: {id} delivery failed: {e}"),
        }
    }
    let _ = handle.unregister();
    delivered
}

/// Drains the host until every producer has finished or a shutdown signal
/// arrives.
fn consume(
    host: &Host<String>,
    listener: &mut Listener,
    producers: &[JoinHandle<usize>],
) -> Result<Totals, DemoError> {
    let mut totals = Totals::default();
    loop {
        while let Polled::Ready(taken) = host.poll() {
            totals.taken += 1;
            totals.outputs += taken.outputs.len();
            // Fails only if the producer was cancelled in the meantime.
            if let Some(mut pending) = taken.pending
                && pending.complete(vec!["ok".to_string()]).is_ok()
            {
                totals.replies += 1;
            }
        }

        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            break;
        }
        if producers.iter().all(JoinHandle::is_finished) && host.queue_size() == 0 {
            break;
        }
        listener.wait(Timeout::Duration(WAIT))?;
    }
    Ok(totals)
}

fn parse_value(args: &[String], i: usize, flag: &str) -> Result<usize, DemoError> {
    let raw = args
        .get(i)
        .ok_or_else(|| DemoError::Args(format!("missing value for {flag}")))?;
    raw.parse()
        .map_err(|e| DemoError::Args(format!("invalid value for {flag}: {e}")))
}

/// Parses command line arguments into a DemoConfig.
fn parse_args(args: &[String]) -> Result<DemoConfig, DemoError> {
    let mut config = DemoConfig {
        port: 0,
        producers: DEFAULT_PRODUCERS,
        items: DEFAULT_ITEMS,
        round_trip_every: DEFAULT_ROUND_TRIP_EVERY,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                let port = parse_value(args, i, "--port")?;
                config.port = u16::try_from(port)
                    .map_err(|_| DemoError::Args(format!("port out of range: {port}")))?;
            }
            "--producers" | "-n" => {
                i += 1;
                config.producers = parse_value(args, i, "--producers")?;
            }
            "--items" | "-i" => {
                i += 1;
                config.items = parse_value(args, i, "--items")?;
            }
            "--round-trip-every" | "-r" => {
                i += 1;
                config.round_trip_every = parse_value(args, i, "--round-trip-every")?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => {
                return Err(DemoError::Args(format!("unknown argument: {arg}")));
            }
        }
        i += 1;
    }
    Ok(config)
}

fn print_usage() {
    eprintln!(
        r#"sidesync-demo - producer/consumer hand-off demo

USAGE:
    sidesync-demo [OPTIONS]

OPTIONS:
    -p, --port <PORT>              Notification listener port (default: ephemeral)
    -n, --producers <N>            Producer threads (default: 4)
    -i, --items <N>                Items per producer (default: 100)
    -r, --round-trip-every <N>     Make every Nth item a round trip, 0 disables (default: 10)
    -h, --help                     Print this help message

SIGNALS:
    SIGTERM, SIGINT                Graceful shutdown

EXAMPLE:
    sidesync-demo --producers 8 --items 10000 --round-trip-every 100
"#
    );
}
