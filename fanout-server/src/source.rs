//! Built-in upstream event source
//!
//! Produces a random hex string at a fixed interval on an mpsc channel. The
//! broadcast engine only sees the receiving end, so any other producer can
//! be plugged in the same way.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};

/// Default time between generated events
pub const DEFAULT_EVENT_INTERVAL: Duration = Duration::from_secs(1);

/// Length of each generated event
const EVENT_LEN: usize = 10;

/// Granularity at which the generator checks the quit flag
const GENERATOR_TICK: Duration = Duration::from_millis(100);

/// Random lowercase hex string of exactly `len` characters
pub fn rand_string(rng: &SystemRandom, len: usize) -> Option<String> {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rng.fill(&mut bytes).ok()?;
    let mut s = hex::encode(bytes);
    s.truncate(len);
    Some(s)
}

/// Start the generator thread. It stops when `quit` is set or the receiver
/// is dropped.
pub fn spawn_generator(
    interval: Duration,
    quit: Arc<AtomicBool>,
) -> io::Result<(Receiver<String>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();

    let handle = thread::Builder::new()
        .name("upstream".into())
        .spawn(move || {
            let rng = SystemRandom::new();
            let mut next = Instant::now() + interval;
            let mut sent: u64 = 0;

            while !quit.load(Ordering::Acquire) {
                let now = Instant::now();
                if now < next {
                    thread::sleep((next - now).min(GENERATOR_TICK));
                    continue;
                }
                next += interval;

                let event = match rand_string(&rng, EVENT_LEN) {
                    Some(e) => e,
                    None => {
                        log::error!("System RNG failed, skipping event");
                        continue;
                    }
                };
                if tx.send(event).is_err() {
                    log::debug!("Upstream receiver dropped");
                    break;
                }
                sent += 1;
            }
            log::info!("Upstream generator stopped after {} events", sent);
        })?;

    Ok((rx, handle))
}
