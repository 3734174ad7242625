//! Connection registry backed by the OS readiness facility
//!
//! The registry owns a `mio::Poll` (epoll on Linux) and maps every live
//! connection's raw descriptor to its handle. Instead of parking one thread
//! per connection in a blocking read, a single `wait()` reports which of the
//! registered descriptors are readable or hung up, so the wake cost is
//! proportional to the number of ready sockets, not the number of open ones.
//!
//! Readiness is edge-triggered: a caller that receives a readable connection
//! must drain it until `WouldBlock` or it will not be reported again. Write
//! interest is edge-triggered as well, so a connection whose socket buffer
//! filled up is reported once more when the peer has drained it.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

// ============================================================================
// Constants
// ============================================================================

/// Default upper bound for a single `wait()`
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum readiness events collected per `wait()`
const EVENTS_CAPACITY: usize = 1024;

/// Token reserved for the waker (never a valid descriptor)
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Log the connection total whenever it crosses a multiple of this
const LOG_EVERY: usize = 100;

// ============================================================================
// Errors
// ============================================================================

/// Errors reported by the connection registry
#[derive(Debug)]
pub enum RegistryError {
    /// The readiness facility rejected the operation
    Io(io::Error),
    /// The descriptor is already tracked
    AlreadyRegistered(RawFd),
    /// The descriptor is not tracked
    NotRegistered(RawFd),
    /// The registry was closed to new connections
    Closed,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Io(e) => write!(f, "readiness facility error: {}", e),
            RegistryError::AlreadyRegistered(fd) => write!(f, "fd {} is already registered", fd),
            RegistryError::NotRegistered(fd) => write!(f, "fd {} is not registered", fd),
            RegistryError::Closed => write!(f, "registry is closed to new connections"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegistryError {
    fn from(e: io::Error) -> Self {
        RegistryError::Io(e)
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// A connection reported by `wait()` and what it is ready for
pub struct Ready<C> {
    pub conn: Arc<C>,
    /// Readable, hung up or in error
    pub readable: bool,
    /// Send buffer has room again
    pub writable: bool,
}

/// Result of a single `wait()`
pub struct Readiness<C> {
    /// Connections whose descriptor is ready
    pub connections: Vec<Ready<C>>,
    /// Whether `wake()` was called since the previous wait
    pub woken: bool,
}

impl<C> Readiness<C> {
    fn empty() -> Self {
        Readiness {
            connections: Vec::new(),
            woken: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty() && !self.woken
    }
}

// ============================================================================
// Registry Structure
// ============================================================================

/// Poll instance plus its event buffer; only `wait()` touches it
struct Poller {
    poll: Poll,
    events: Events,
}

/// Registry of live connections keyed by raw descriptor
pub struct ConnectionRegistry<C> {
    /// Poll used exclusively by `wait()`
    poller: Mutex<Poller>,
    /// Cloned registry handle for add/remove from other threads
    registry: mio::Registry,
    /// Interrupts a pending `wait()`
    waker: Waker,
    /// Descriptor -> connection handle
    connections: RwLock<HashMap<RawFd, Arc<C>>>,
    /// Set by `close()`; checked under the connections write lock
    closed: AtomicBool,
    /// Upper bound of a single `wait()`
    timeout: Duration,
}

impl<C: AsRawFd> ConnectionRegistry<C> {
    /// Create a registry with the default poll timeout
    pub fn new() -> Result<Self, RegistryError> {
        Self::with_timeout(DEFAULT_POLL_TIMEOUT)
    }

    /// Create a registry whose `wait()` returns after at most `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self, RegistryError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(ConnectionRegistry {
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            }),
            registry,
            waker,
            connections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            timeout,
        })
    }

    /// Start tracking a connection for read, write and hang-up readiness
    pub fn register(&self, conn: Arc<C>) -> Result<(), RegistryError> {
        let fd = conn.as_raw_fd();

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        if connections.contains_key(&fd) {
            return Err(RegistryError::AlreadyRegistered(fd));
        }

        // Nothing is recorded unless the OS accepted the descriptor
        self.registry
            .register(
                &mut SourceFd(&fd),
                Token(fd as usize),
                Interest::READABLE | Interest::WRITABLE,
            )?;
        connections.insert(fd, conn);

        let total = connections.len();
        if total % LOG_EVERY == 0 {
            log::info!("Total number of connections: {}", total);
        }
        log::debug!("Registered fd {} ({} connections)", fd, total);
        Ok(())
    }

    /// Stop tracking a connection
    pub fn deregister(&self, conn: &C) -> Result<(), RegistryError> {
        let fd = conn.as_raw_fd();

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if !connections.contains_key(&fd) {
            return Err(RegistryError::NotRegistered(fd));
        }

        let result = self.registry.deregister(&mut SourceFd(&fd));
        // The entry goes regardless: a descriptor the kernel no longer knows
        // (already closed) is not live either.
        connections.remove(&fd);

        let total = connections.len();
        if total % LOG_EVERY == 0 {
            log::info!("Total number of connections: {}", total);
        }
        log::debug!("Deregistered fd {} ({} connections)", fd, total);
        result.map_err(RegistryError::from)
    }

    /// Block until a registered descriptor is ready, `wake()` is called, or
    /// the poll timeout elapses.
    pub fn wait(&self) -> Result<Readiness<C>, RegistryError> {
        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        let Poller { poll, events } = &mut *poller;

        match poll.poll(events, Some(self.timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Readiness::empty()),
            Err(e) => return Err(e.into()),
        }

        let mut readiness = Readiness::empty();
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                readiness.woken = true;
                continue;
            }
            let fd = event.token().0 as RawFd;
            // Descriptors deregistered since the kernel queued the event are skipped
            if let Some(conn) = connections.get(&fd) {
                readiness.connections.push(Ready {
                    conn: Arc::clone(conn),
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed(),
                });
            }
        }
        Ok(readiness)
    }

    /// Refuse every later `register()`. Already registered connections are
    /// left alone.
    pub fn close(&self) {
        let _connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Make the current (or next) `wait()` return immediately
    pub fn wake(&self) -> Result<(), RegistryError> {
        self.waker.wake().map_err(RegistryError::from)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    const TEST_TIMEOUT: Duration = Duration::from_millis(100);

    fn make_pair() -> (Arc<UnixStream>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (Arc::new(a), b)
    }

    #[test]
    fn test_register_and_deregister() {
        let registry = ConnectionRegistry::with_timeout(TEST_TIMEOUT).unwrap();
        let (conn, _peer) = make_pair();

        registry.register(Arc::clone(&conn)).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(conn.as_raw_fd()));

        registry.deregister(&conn).unwrap();
        assert!(registry.is_empty());
        assert!(!registry.contains(conn.as_raw_fd()));
    }

    #[test]
    fn test_register_twice_keeps_one_entry() {
        let registry = ConnectionRegistry::with_timeout(TEST_TIMEOUT).unwrap();
        let (conn, _peer) = make_pair();

        registry.register(Arc::clone(&conn)).unwrap();
        let second = registry.register(Arc::clone(&conn));

        assert!(matches!(second, Err(RegistryError::AlreadyRegistered(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_after_close_is_refused() {
        let registry = ConnectionRegistry::with_timeout(TEST_TIMEOUT).unwrap();
        let (kept, _kept_peer) = make_pair();
        let (late, _late_peer) = make_pair();

        registry.register(Arc::clone(&kept)).unwrap();
        registry.close();

        assert!(matches!(registry.register(Arc::clone(&late)), Err(RegistryError::Closed)));
        assert!(registry.is_closed());
        assert!(registry.contains(kept.as_raw_fd()));
        assert!(!registry.contains(late.as_raw_fd()));
        registry.deregister(&kept).unwrap();
    }

    #[test]
    fn test_deregister_unknown_is_error() {
        let registry = ConnectionRegistry::<UnixStream>::with_timeout(TEST_TIMEOUT).unwrap();
        let (conn, _peer) = make_pair();

        let result = registry.deregister(&conn);
        assert!(matches!(result, Err(RegistryError::NotRegistered(_))));
    }

    #[test]
    fn test_wait_reports_readable() {
        let registry = ConnectionRegistry::with_timeout(TEST_TIMEOUT).unwrap();
        let (conn, mut peer) = make_pair();
        let (idle, _idle_peer) = make_pair();

        registry.register(Arc::clone(&conn)).unwrap();
        registry.register(Arc::clone(&idle)).unwrap();
        peer.write_all(b"ping").unwrap();

        // Both sockets start out writable; only one has data
        let readiness = registry.wait().unwrap();
        let readable: Vec<RawFd> = readiness
            .connections
            .iter()
            .filter(|r| r.readable)
            .map(|r| r.conn.as_raw_fd())
            .collect();
        assert_eq!(readable, vec![conn.as_raw_fd()]);
        assert!(!readiness.woken);
    }

    #[test]
    fn test_wait_reports_hangup() {
        let registry = ConnectionRegistry::with_timeout(TEST_TIMEOUT).unwrap();
        let (conn, peer) = make_pair();

        registry.register(Arc::clone(&conn)).unwrap();
        drop(peer);

        let readiness = registry.wait().unwrap();
        assert_eq!(readiness.connections.len(), 1);
        assert!(readiness.connections[0].readable);
    }

    #[test]
    fn test_wait_reports_writable_again_after_peer_drains() {
        use std::io::Read;

        let registry = ConnectionRegistry::with_timeout(TEST_TIMEOUT).unwrap();
        let (conn, mut peer) = make_pair();
        registry.register(Arc::clone(&conn)).unwrap();

        // Initial edge
        let readiness = registry.wait().unwrap();
        assert!(readiness.connections.iter().any(|r| r.writable));

        // Fill the socket until the kernel refuses more
        let chunk = [0u8; 4096];
        loop {
            match (&*conn).write(&chunk) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        // Peer drains; the connection is reported writable again
        peer.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 65536];
        let mut writable = false;
        for _ in 0..50 {
            loop {
                match peer.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            let readiness = registry.wait().unwrap();
            if readiness.connections.iter().any(|r| r.writable) {
                writable = true;
                break;
            }
        }
        assert!(writable);
    }

    #[test]
    fn test_wait_after_deregister_all_is_empty() {
        let registry = ConnectionRegistry::with_timeout(TEST_TIMEOUT).unwrap();
        let (a, mut peer_a) = make_pair();
        let (b, mut peer_b) = make_pair();

        registry.register(Arc::clone(&a)).unwrap();
        registry.register(Arc::clone(&b)).unwrap();
        registry.deregister(&a).unwrap();
        registry.deregister(&b).unwrap();
        peer_a.write_all(b"x").unwrap();
        peer_b.write_all(b"y").unwrap();

        let started = Instant::now();
        let readiness = registry.wait().unwrap();
        assert!(readiness.is_empty());
        assert!(started.elapsed() >= TEST_TIMEOUT / 2);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let registry = Arc::new(
            ConnectionRegistry::<UnixStream>::with_timeout(Duration::from_secs(10)).unwrap(),
        );

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let started = Instant::now();
                let readiness = registry.wait().unwrap();
                (readiness.woken, started.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        registry.wake().unwrap();

        let (woken, elapsed) = waiter.join().unwrap();
        assert!(woken);
        assert!(elapsed < Duration::from_secs(5));
    }
}
