//! Broadcast engine
//!
//! Two loops share the binding map:
//! - the fan-out loop copies each upstream event into every bound watcher;
//! - the delivery loop waits on the connection registry and, for every ready
//!   connection, moves one pending event from its watcher onto the socket.
//!
//! Delivery units run concurrently within a batch but never mutate shared
//! maps. They hand a [`DeliveryOutcome`] back to the delivery loop, which is
//! the only place teardown is triggered from during normal operation.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tungstenite::error::ProtocolError;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

use crate::auth::unix_now;
use crate::client::{Connection, ConnectionId};
use crate::metrics::Metrics;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::watcher::Watcher;

// ============================================================================
// Constants
// ============================================================================

/// Default upper bound on concurrent delivery units per batch
pub const DEFAULT_MAX_WORKERS: usize = 64;

/// How often the fan-out loop re-checks the quit flag while idle
const FANOUT_TICK: Duration = Duration::from_millis(250);

// ============================================================================
// Types
// ============================================================================

/// Statistics for one client session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    /// Client identity (watcher id)
    pub id: String,
    /// Events enqueued for this client
    pub delivered: u64,
    /// Unix time the session was bound
    pub connected_at: u64,
}

impl SessionStats {
    fn new(id: String) -> Self {
        SessionStats {
            id,
            delivered: 0,
            connected_at: unix_now(),
        }
    }

    fn print(&self) {
        log::info!(
            "Session {} closed: {} events delivered in {}s",
            self.id,
            self.delivered,
            unix_now().saturating_sub(self.connected_at)
        );
    }
}

/// Why a connection stopped
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Normal, going-away or no-status close, or the peer simply left
    Expected(String),
    /// Anything else (protocol violation, reset mid-frame, ...)
    Unexpected(String),
}

/// Result of one delivery unit
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// One event was written (or queued behind a full socket buffer)
    Delivered,
    /// Nothing to send
    Idle,
    /// The connection is finished and must be torn down
    Closed(CloseReason),
}

/// What the kernel reported for a connection in this cycle
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Interest {
    readable: bool,
    writable: bool,
}

/// A bound connection and its watcher
struct Binding {
    conn: Arc<Connection>,
    watcher: Arc<dyn Watcher>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct BroadcastEngine {
    /// Readiness registry for every bound connection
    registry: Arc<ConnectionRegistry<Connection>>,
    /// Connection -> watcher
    bindings: RwLock<HashMap<ConnectionId, Binding>>,
    /// Client identity -> session statistics
    stats: Mutex<HashMap<String, SessionStats>>,
    metrics: Arc<Metrics>,
    max_workers: usize,
}

impl BroadcastEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry<Connection>>,
        metrics: Arc<Metrics>,
        max_workers: usize,
    ) -> Self {
        BroadcastEngine {
            registry,
            bindings: RwLock::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            metrics,
            max_workers: max_workers.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<Connection>> {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------------

    /// Register the connection for readiness and bind it to `watcher`.
    ///
    /// Registration and binding happen under the binding map's write lock, so
    /// a readiness event or a shutdown sweep never sees one without the
    /// other. On error nothing is bound; the caller still owns closing the
    /// socket.
    pub fn bind(&self, conn: Arc<Connection>, watcher: Arc<dyn Watcher>) -> Result<(), RegistryError> {
        let identity = watcher.id().to_string();

        {
            let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
            if bindings.contains_key(&conn.id()) {
                return Err(RegistryError::AlreadyRegistered(conn.as_raw_fd()));
            }
            self.registry.register(Arc::clone(&conn))?;
            bindings.insert(conn.id(), Binding { conn: Arc::clone(&conn), watcher });
            self.stats
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(identity.clone(), SessionStats::new(identity.clone()));
            self.metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        }

        log::info!("Bound {} ({}) to watcher {}", conn.id(), conn.peer(), identity);
        Ok(())
    }

    /// Tear a connection down: deregister, unbind, stop its watcher, print
    /// its statistics and close the socket.
    ///
    /// Runs at most once per connection; later calls return `None`.
    pub fn teardown(&self, conn: &Connection) -> Option<SessionStats> {
        if !conn.begin_teardown() {
            return None;
        }

        match self.registry.deregister(conn) {
            Ok(()) => {}
            Err(RegistryError::NotRegistered(_)) => {
                log::debug!("{} was not registered at teardown", conn.id());
            }
            Err(e) => log::warn!("Failed to deregister {}: {}", conn.id(), e),
        }

        let binding = self
            .bindings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn.id());

        let stats = binding.and_then(|binding| {
            binding.watcher.stop();
            self.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
            self.stats
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(binding.watcher.id())
        });
        if let Some(stats) = &stats {
            stats.print();
        }

        conn.close();
        log::debug!("Tore down {} ({})", conn.id(), conn.peer());
        stats
    }

    /// Refuse new bindings, then tear down every bound connection
    pub fn shutdown(&self) -> usize {
        self.registry.close();
        self.teardown_all()
    }

    /// Tear down every bound connection
    pub fn teardown_all(&self) -> usize {
        let conns: Vec<Arc<Connection>> = self
            .bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| Arc::clone(&b.conn))
            .collect();

        conns.iter().filter(|c| self.teardown(c).is_some()).count()
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshot of every live session's statistics
    pub fn session_stats(&self) -> Vec<SessionStats> {
        let mut stats: Vec<SessionStats> = self
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    fn watcher_for(&self, id: ConnectionId) -> Option<Arc<dyn Watcher>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|b| Arc::clone(&b.watcher))
    }

    /// Bound connections whose watcher has something to send and whose
    /// socket is not backed up
    fn pending_connections(&self) -> Vec<Arc<Connection>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|b| b.watcher.has_pending() && !b.conn.is_write_blocked())
            .map(|b| Arc::clone(&b.conn))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Enqueue `event` into every bound watcher; returns how many there were
    pub fn notify_watchers(&self, event: &str) -> usize {
        let notified = {
            let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());

            for binding in bindings.values() {
                binding.watcher.send(event);
                if let Some(s) = stats.get_mut(binding.watcher.id()) {
                    s.delivered += 1;
                }
            }
            bindings.len()
        };

        self.metrics.events_fanned_out_total.fetch_add(1, Ordering::Relaxed);
        if notified > 0 {
            if let Err(e) = self.registry.wake() {
                log::warn!("Failed to wake delivery loop: {}", e);
            }
        }
        notified
    }

    /// Consume upstream events until `quit` is set or the source closes
    pub fn run_fanout(&self, events: &Receiver<String>, quit: &AtomicBool) {
        log::info!("Fan-out loop started");
        while !quit.load(Ordering::Acquire) {
            match events.recv_timeout(FANOUT_TICK) {
                Ok(event) => {
                    let n = self.notify_watchers(&event);
                    log::trace!("Fanned out event to {} watchers", n);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    log::info!("Upstream event source closed");
                    break;
                }
            }
        }
        log::info!("Fan-out loop stopped");
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Wait for ready connections and deliver until `quit` is set
    pub fn run_delivery(&self, quit: &AtomicBool) {
        log::info!("Delivery loop started (max {} workers)", self.max_workers);
        while !quit.load(Ordering::Acquire) {
            if let Err(e) = self.delivery_cycle() {
                log::error!("Failed to wait for ready connections: {}", e);
            }
        }
        log::info!("Delivery loop stopped");
    }

    /// One `wait()` plus the joined batch of delivery units it produced.
    ///
    /// Returns the number of connections torn down.
    pub fn delivery_cycle(&self) -> Result<usize, RegistryError> {
        let readiness = self.registry.wait()?;

        // Sockets the kernel reported first, then anything with queued events
        let mut batch: HashMap<ConnectionId, (Arc<Connection>, Interest)> = HashMap::new();
        for ready in readiness.connections {
            let interest = Interest {
                readable: ready.readable,
                writable: ready.writable,
            };
            batch.insert(ready.conn.id(), (ready.conn, interest));
        }
        if readiness.woken {
            for conn in self.pending_connections() {
                batch.entry(conn.id()).or_insert((conn, Interest::default()));
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let batch: Vec<(Arc<Connection>, Interest)> = batch.into_values().collect();
        let outcomes = self.run_batch(&batch);

        let mut closed = 0;
        for (conn, outcome) in outcomes {
            match outcome {
                DeliveryOutcome::Delivered => {
                    self.metrics.messages_delivered_total.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryOutcome::Idle => {}
                DeliveryOutcome::Closed(reason) => {
                    match &reason {
                        CloseReason::Expected(why) => {
                            log::debug!("{} closed: {}", conn.id(), why);
                        }
                        CloseReason::Unexpected(why) => {
                            log::warn!("{} failed: {}", conn.id(), why);
                            self.metrics.delivery_errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if self.teardown(&conn).is_some() {
                        closed += 1;
                    }
                }
            }
        }

        // Keep draining without waiting for the poll timeout
        if !self.pending_connections().is_empty() {
            if let Err(e) = self.registry.wake() {
                log::warn!("Failed to re-arm delivery loop: {}", e);
            }
        }
        Ok(closed)
    }

    /// Run one delivery unit per connection across at most `max_workers`
    /// scoped threads and join them all.
    fn run_batch(&self, batch: &[(Arc<Connection>, Interest)]) -> Vec<(Arc<Connection>, DeliveryOutcome)> {
        let chunk_size = batch.len().div_ceil(self.max_workers);

        thread::scope(|scope| {
            let handles: Vec<_> = batch
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|(conn, interest)| (Arc::clone(conn), self.deliver_guarded(conn, *interest)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let mut outcomes = Vec::with_capacity(batch.len());
            for handle in handles {
                match handle.join() {
                    Ok(chunk) => outcomes.extend(chunk),
                    Err(_) => log::error!("Delivery worker panicked"),
                }
            }
            outcomes
        })
    }

    /// A panicking unit only takes its own connection down
    fn deliver_guarded(&self, conn: &Connection, interest: Interest) -> DeliveryOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.deliver(conn, interest))) {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::Closed(CloseReason::Unexpected("delivery unit panicked".to_string())),
        }
    }

    /// Delivery unit for one connection
    fn deliver(&self, conn: &Connection, interest: Interest) -> DeliveryOutcome {
        if conn.is_torn_down() {
            return DeliveryOutcome::Idle;
        }
        let watcher = match self.watcher_for(conn.id()) {
            Some(w) => w,
            None => return DeliveryOutcome::Idle,
        };

        let mut socket = conn.socket();

        if interest.readable {
            if let Err(reason) = drain_inbound(&mut socket) {
                return DeliveryOutcome::Closed(reason);
            }
        }

        // Frames held back by a full socket go out before anything new. Until
        // they do, events stay in the watcher, which bounds the backlog.
        if conn.is_write_blocked() {
            if !interest.writable {
                return DeliveryOutcome::Idle;
            }
            match socket.flush() {
                Ok(()) => conn.set_write_blocked(false),
                Err(e) => {
                    return match classify(e) {
                        Some(reason) => DeliveryOutcome::Closed(reason),
                        None => DeliveryOutcome::Idle,
                    }
                }
            }
        }

        let event = match watcher.try_recv() {
            Some(event) => event,
            None => {
                // Push out pongs and close replies
                return match socket.flush() {
                    Ok(()) => DeliveryOutcome::Idle,
                    Err(e) => match classify(e) {
                        Some(reason) => DeliveryOutcome::Closed(reason),
                        None => {
                            conn.set_write_blocked(true);
                            DeliveryOutcome::Idle
                        }
                    },
                };
            }
        };

        let payload = match encode_event(&event) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode event for {}: {}", conn.id(), e);
                return DeliveryOutcome::Idle;
            }
        };

        match socket.send(Message::text(payload)) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(tungstenite::Error::WriteBufferFull(_)) => {
                log::warn!("{} write buffer full, dropping event", conn.id());
                match socket.flush() {
                    Ok(()) => DeliveryOutcome::Idle,
                    Err(e) => match classify(e) {
                        Some(reason) => DeliveryOutcome::Closed(reason),
                        None => {
                            conn.set_write_blocked(true);
                            DeliveryOutcome::Idle
                        }
                    },
                }
            }
            Err(e) => match classify(e) {
                Some(reason) => DeliveryOutcome::Closed(reason),
                // Queued in the write buffer; flushed once the socket is
                // reported writable again
                None => {
                    conn.set_write_blocked(true);
                    DeliveryOutcome::Delivered
                }
            },
        }
    }
}

// ============================================================================
// Wire Helpers
// ============================================================================

/// Wire encoding of an event: the JSON value of its payload
pub fn encode_event(event: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Read and discard client frames until the socket would block.
///
/// tungstenite answers pings and close frames on its own.
fn drain_inbound(socket: &mut tungstenite::WebSocket<std::net::TcpStream>) -> Result<(), CloseReason> {
    loop {
        match socket.read() {
            Ok(Message::Close(frame)) => return Err(close_frame_reason(frame.as_ref())),
            Ok(msg) => log::trace!("Ignoring client frame ({} bytes)", msg.len()),
            Err(e) => {
                return match classify(e) {
                    Some(reason) => Err(reason),
                    None => Ok(()),
                }
            }
        }
    }
}

fn close_frame_reason(frame: Option<&CloseFrame>) -> CloseReason {
    match frame {
        None => CloseReason::Expected("close without status".to_string()),
        Some(f) => match f.code {
            CloseCode::Normal | CloseCode::Away | CloseCode::Status => {
                CloseReason::Expected(format!("close {}", u16::from(f.code)))
            }
            code => CloseReason::Unexpected(format!("close {} {}", u16::from(code), f.reason.as_str())),
        },
    }
}

/// Map a tungstenite error to a close reason; `None` means "would block".
pub fn classify(e: tungstenite::Error) -> Option<CloseReason> {
    match e {
        tungstenite::Error::Io(ref io) if io.kind() == io::ErrorKind::WouldBlock => None,
        tungstenite::Error::Io(io) => match io.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Some(CloseReason::Expected(io.to_string())),
            _ => Some(CloseReason::Unexpected(io.to_string())),
        },
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Some(CloseReason::Expected("connection closed".to_string()))
        }
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            Some(CloseReason::Expected("peer left without closing handshake".to_string()))
        }
        other => Some(CloseReason::Unexpected(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::loopback_pair;
    use crate::watcher::QueueWatcher;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Instant;
    use tungstenite::protocol::Role;
    use tungstenite::WebSocket;

    /// Watcher that only counts what it is given
    struct CountingWatcher {
        id: String,
        sends: AtomicUsize,
        stops: AtomicUsize,
    }

    impl CountingWatcher {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(CountingWatcher {
                id: id.to_string(),
                sends: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl Watcher for CountingWatcher {
        fn id(&self) -> &str {
            &self.id
        }
        fn start(&self) -> Result<(), crate::watcher::WatcherError> {
            Ok(())
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn send(&self, _event: &str) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }
        fn try_recv(&self) -> Option<String> {
            None
        }
        fn has_pending(&self) -> bool {
            false
        }
    }

    fn make_engine() -> BroadcastEngine {
        let registry = ConnectionRegistry::with_timeout(Duration::from_millis(50)).unwrap();
        BroadcastEngine::new(Arc::new(registry), Arc::new(Metrics::new()), 4)
    }

    #[test]
    fn test_notify_reaches_every_bound_watcher_once() {
        let engine = make_engine();
        let mut peers = Vec::new();
        let mut watchers = Vec::new();
        let mut conns = Vec::new();

        for i in 0..5 {
            let (conn, peer) = loopback_pair();
            let conn = Arc::new(conn);
            let watcher = CountingWatcher::new(&format!("w{}", i));
            engine.bind(Arc::clone(&conn), watcher.clone()).unwrap();
            peers.push(peer);
            watchers.push(watcher);
            conns.push(conn);
        }

        // Unbind one before the event
        engine.teardown(&conns[2]).unwrap();

        assert_eq!(engine.notify_watchers("x"), 4);
        for (i, w) in watchers.iter().enumerate() {
            let expected = if i == 2 { 0 } else { 1 };
            assert_eq!(w.sends.load(Ordering::SeqCst), expected, "watcher {}", i);
        }
        assert_eq!(watchers[2].stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bind_counts_stats_per_identity() {
        let engine = make_engine();
        let (conn, _peer) = loopback_pair();
        let conn = Arc::new(conn);
        engine.bind(Arc::clone(&conn), CountingWatcher::new("alice")).unwrap();

        engine.notify_watchers("a");
        engine.notify_watchers("b");

        let stats = engine.session_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].id, "alice");
        assert_eq!(stats[0].delivered, 2);

        let final_stats = engine.teardown(&conn).unwrap();
        assert_eq!(final_stats.delivered, 2);
        assert!(engine.session_stats().is_empty());
        assert_eq!(engine.bound_count(), 0);
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_bind_twice_fails_without_second_binding() {
        let engine = make_engine();
        let (conn, _peer) = loopback_pair();
        let conn = Arc::new(conn);

        engine.bind(Arc::clone(&conn), CountingWatcher::new("a")).unwrap();
        let second = engine.bind(Arc::clone(&conn), CountingWatcher::new("b"));

        assert!(matches!(second, Err(RegistryError::AlreadyRegistered(_))));
        assert_eq!(engine.bound_count(), 1);
        assert_eq!(engine.registry().len(), 1);
    }

    #[test]
    fn test_concurrent_teardown_runs_once() {
        let engine = Arc::new(make_engine());
        let (conn, _peer) = loopback_pair();
        let conn = Arc::new(conn);
        let watcher = CountingWatcher::new("racer");
        engine.bind(Arc::clone(&conn), watcher.clone()).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let conn = Arc::clone(&conn);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    engine.teardown(&conn)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(watcher.stops.load(Ordering::SeqCst), 1);
        assert_eq!(engine.bound_count(), 0);
    }

    #[test]
    fn test_delivery_cycle_tears_down_hung_up_peer() {
        let engine = make_engine();
        let (conn, peer) = loopback_pair();
        let conn = Arc::new(conn);
        engine.bind(Arc::clone(&conn), CountingWatcher::new("gone")).unwrap();

        drop(peer);

        let mut closed = 0;
        for _ in 0..20 {
            closed += engine.delivery_cycle().unwrap();
            if closed > 0 {
                break;
            }
        }
        assert_eq!(closed, 1);
        assert!(conn.is_torn_down());
        assert_eq!(engine.bound_count(), 0);
    }

    #[test]
    fn test_bind_after_shutdown_is_refused() {
        let engine = make_engine();
        let (early, _early_peer) = loopback_pair();
        engine.bind(Arc::new(early), CountingWatcher::new("early")).unwrap();

        assert_eq!(engine.shutdown(), 1);

        // A handshake that finished after the sweep must not leave a binding
        let (late, _late_peer) = loopback_pair();
        let result = engine.bind(Arc::new(late), CountingWatcher::new("late"));
        assert!(matches!(result, Err(RegistryError::Closed)));
        assert_eq!(engine.bound_count(), 0);
        assert!(engine.registry().is_empty());
        assert!(engine.session_stats().is_empty());
    }

    /// Watcher whose dequeue always panics
    struct PanickingWatcher;

    impl Watcher for PanickingWatcher {
        fn id(&self) -> &str {
            "panicky"
        }
        fn start(&self) -> Result<(), crate::watcher::WatcherError> {
            Ok(())
        }
        fn stop(&self) {}
        fn send(&self, _event: &str) {}
        fn try_recv(&self) -> Option<String> {
            panic!("dequeue failed");
        }
        fn has_pending(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_panicking_unit_only_closes_its_connection() {
        // One worker, so both units share a chunk
        let registry = ConnectionRegistry::with_timeout(Duration::from_millis(50)).unwrap();
        let engine = BroadcastEngine::new(Arc::new(registry), Arc::new(Metrics::new()), 1);

        let (bad, _bad_peer) = loopback_pair();
        let bad = Arc::new(bad);
        engine.bind(Arc::clone(&bad), Arc::new(PanickingWatcher)).unwrap();

        let (good, good_peer) = loopback_pair();
        let good = Arc::new(good);
        let watcher = Arc::new(QueueWatcher::with_id("steady", 8));
        watcher.start().unwrap();
        engine.bind(Arc::clone(&good), watcher.clone()).unwrap();

        engine.notify_watchers("hello");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !bad.is_torn_down() || !watcher.is_empty() {
            assert!(Instant::now() < deadline, "delivery did not settle");
            engine.delivery_cycle().unwrap();
        }

        assert!(!good.is_torn_down());
        assert_eq!(engine.bound_count(), 1);
        assert_eq!(engine.metrics.delivery_errors_total.load(Ordering::Relaxed), 1);

        good_peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = WebSocket::from_raw_socket(good_peer, Role::Client, None);
        let msg = reader.read().unwrap();
        assert_eq!(serde_json::from_str::<String>(msg.to_text().unwrap()).unwrap(), "hello");
    }

    /// Large events so a few hundred of them overrun the kernel socket buffers
    fn big_event(seq: usize) -> String {
        format!("{:04}:{}", seq, "x".repeat(64 * 1024))
    }

    /// Read `count` events from the client end of a loopback pair
    fn spawn_reader(peer: TcpStream, count: usize) -> thread::JoinHandle<Vec<String>> {
        thread::spawn(move || {
            peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let mut socket = WebSocket::from_raw_socket(peer, Role::Client, None);
            let mut events = Vec::with_capacity(count);
            while events.len() < count {
                match socket.read().unwrap() {
                    Message::Text(text) => events.push(serde_json::from_str::<String>(&text).unwrap()),
                    other => panic!("unexpected frame {:?}", other),
                }
            }
            events
        })
    }

    fn assert_in_order(events: &[String], count: usize) {
        assert_eq!(events.len(), count);
        for (seq, event) in events.iter().enumerate() {
            assert!(event.starts_with(&format!("{:04}:", seq)), "event {} out of order", seq);
        }
    }

    #[test]
    fn test_backlogged_events_flush_after_upstream_goes_quiet() {
        const COUNT: usize = 384;
        let engine = make_engine();
        let (conn, peer) = loopback_pair();
        let conn = Arc::new(conn);
        let watcher = Arc::new(QueueWatcher::with_id("sleepy", COUNT * 2));
        watcher.start().unwrap();
        engine.bind(Arc::clone(&conn), watcher.clone()).unwrap();

        // Upstream sends everything, then goes quiet for good
        for seq in 0..COUNT {
            engine.notify_watchers(&big_event(seq));
        }

        // The client is not reading yet, so the socket backs up
        let deadline = Instant::now() + Duration::from_secs(10);
        while !conn.is_write_blocked() {
            assert!(Instant::now() < deadline, "socket never backed up");
            engine.delivery_cycle().unwrap();
        }
        assert!(!watcher.is_empty());

        // The client catches up; only writable readiness can move the rest
        let reader = spawn_reader(peer, COUNT);
        let deadline = Instant::now() + Duration::from_secs(30);
        while !reader.is_finished() {
            assert!(Instant::now() < deadline, "backlog was never flushed");
            engine.delivery_cycle().unwrap();
        }

        let events = reader.join().unwrap();
        assert_in_order(&events, COUNT);
        assert_eq!(watcher.dropped(), 0);
        assert!(!conn.is_write_blocked());
    }

    #[test]
    fn test_stalled_client_is_bounded_while_healthy_client_keeps_receiving() {
        const COUNT: usize = 400;
        const STALLED_CAPACITY: usize = 16;
        let engine = make_engine();

        let (stalled, _stalled_peer) = loopback_pair();
        let stalled = Arc::new(stalled);
        let stalled_watcher = Arc::new(QueueWatcher::with_id("stalled", STALLED_CAPACITY));
        stalled_watcher.start().unwrap();
        engine.bind(Arc::clone(&stalled), stalled_watcher.clone()).unwrap();

        let (healthy, healthy_peer) = loopback_pair();
        let healthy = Arc::new(healthy);
        let healthy_watcher = Arc::new(QueueWatcher::with_id("healthy", COUNT));
        healthy_watcher.start().unwrap();
        engine.bind(Arc::clone(&healthy), healthy_watcher.clone()).unwrap();

        let reader = spawn_reader(healthy_peer, COUNT);
        let deadline = Instant::now() + Duration::from_secs(60);
        for seq in 0..COUNT {
            engine.notify_watchers(&big_event(seq));
            while !healthy_watcher.is_empty() {
                assert!(Instant::now() < deadline, "healthy client starved at {}", seq);
                engine.delivery_cycle().unwrap();
            }
        }
        while !reader.is_finished() {
            assert!(Instant::now() < deadline, "healthy client never caught up");
            engine.delivery_cycle().unwrap();
        }

        assert_in_order(&reader.join().unwrap(), COUNT);
        assert_eq!(healthy_watcher.dropped(), 0);

        // The stalled client sheds old events instead of growing buffers
        assert!(stalled.is_write_blocked());
        assert!(stalled_watcher.len() <= STALLED_CAPACITY);
        assert!(stalled_watcher.dropped() > 0);
        assert!(!stalled.is_torn_down());
    }

    #[test]
    fn test_encode_event_is_json_string() {
        assert_eq!(encode_event("x").unwrap(), "\"x\"");
        assert_eq!(encode_event("a\"b").unwrap(), "\"a\\\"b\"");
    }

    #[test]
    fn test_close_frame_classification() {
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        let policy = CloseFrame {
            code: CloseCode::Policy,
            reason: "nope".into(),
        };
        assert!(matches!(close_frame_reason(None), CloseReason::Expected(_)));
        assert!(matches!(close_frame_reason(Some(&normal)), CloseReason::Expected(_)));
        assert!(matches!(close_frame_reason(Some(&policy)), CloseReason::Unexpected(_)));
    }

    #[test]
    fn test_classify_would_block() {
        let e = tungstenite::Error::Io(io::Error::from(io::ErrorKind::WouldBlock));
        assert_eq!(classify(e), None);
        let e = tungstenite::Error::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(classify(e), Some(CloseReason::Expected(_))));
        assert!(matches!(
            classify(tungstenite::Error::ConnectionClosed),
            Some(CloseReason::Expected(_))
        ));
    }
}
