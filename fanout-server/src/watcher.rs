//! Per-client outbound event buffers
//!
//! A watcher sits between the fan-out loop and one client's socket. The
//! engine only relies on the [`Watcher`] contract: enqueueing never blocks,
//! and dequeueing never waits for new data.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use ring::rand::{SecureRandom, SystemRandom};

/// Default number of events buffered per client
pub const DEFAULT_WATCHER_CAPACITY: usize = 256;

/// Random bytes in a watcher id (hex encoded, so twice as many characters)
const WATCHER_ID_BYTES: usize = 8;

// ============================================================================
// Contract
// ============================================================================

/// Errors from the watcher lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherError {
    /// `start()` called on a running watcher
    AlreadyStarted,
    /// `start()` called after `stop()`
    Stopped,
    /// No randomness available for the watcher id
    Rng,
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherError::AlreadyStarted => write!(f, "watcher already started"),
            WatcherError::Stopped => write!(f, "watcher was stopped"),
            WatcherError::Rng => write!(f, "failed to generate watcher id"),
        }
    }
}

impl std::error::Error for WatcherError {}

/// Per-connection message buffer as seen by the broadcast engine
pub trait Watcher: Send + Sync {
    /// Client identity (used for session statistics)
    fn id(&self) -> &str;

    /// Begin accepting events
    fn start(&self) -> Result<(), WatcherError>;

    /// Stop accepting events and release anything buffered
    fn stop(&self);

    /// Enqueue an event for this client. Must not block.
    fn send(&self, event: &str);

    /// Take the oldest buffered event, if any. Must not block.
    fn try_recv(&self) -> Option<String>;

    /// Whether `try_recv` would currently yield an event
    fn has_pending(&self) -> bool;
}

// ============================================================================
// Bounded Queue Watcher
// ============================================================================

/// Default watcher: a bounded FIFO that drops the oldest event when full
pub struct QueueWatcher {
    id: String,
    capacity: usize,
    queue: Mutex<VecDeque<String>>,
    running: AtomicBool,
    stopped: AtomicBool,
    /// Events discarded because the client fell behind
    dropped: AtomicU64,
}

impl QueueWatcher {
    /// Create a watcher with a random hex id
    pub fn new(capacity: usize) -> Result<Self, WatcherError> {
        let mut bytes = [0u8; WATCHER_ID_BYTES];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| WatcherError::Rng)?;
        Ok(Self::with_id(hex::encode(bytes), capacity))
    }

    pub fn with_id(id: impl Into<String>, capacity: usize) -> Self {
        QueueWatcher {
            id: id.into(),
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Watcher for QueueWatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&self) -> Result<(), WatcherError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(WatcherError::Stopped);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(WatcherError::AlreadyStarted);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn send(&self, event: &str) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 1000 == 0 {
                log::warn!("Watcher {} is falling behind ({} events dropped)", self.id, dropped);
            }
        }
        queue.push_back(event.to_string());
    }

    fn try_recv(&self) -> Option<String> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn has_pending(&self) -> bool {
        !self.is_empty()
    }
}
