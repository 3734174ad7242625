//! Server lifecycle
//!
//! Owns the listening sockets and every long-running thread:
//! - acceptor (mio-polled listener, one short-lived thread per request)
//! - fan-out loop (upstream events -> watchers)
//! - delivery loop (registry readiness -> sockets)
//! - admission token reaper (only with the gate enabled)
//! - debug acceptor (optional, local address)

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tungstenite::http::StatusCode;

use crate::auth::AdmissionGate;
use crate::config::ServerConfig;
use crate::engine::BroadcastEngine;
use crate::handshake::{self, HandshakeContext, HandshakeError};
use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;

// ============================================================================
// Constants
// ============================================================================

/// mio token for a listening socket
const LISTENER_TOKEN: Token = Token(0);

/// How often acceptors re-check their stop flag
const ACCEPT_TICK: Duration = Duration::from_millis(250);

/// How often shutdown re-checks in-flight requests
const DRAIN_TICK: Duration = Duration::from_millis(20);

type RequestHandler = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

// ============================================================================
// Server Structure
// ============================================================================

pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    debug_addr: Option<SocketAddr>,
    engine: Arc<BroadcastEngine>,
    gate: Option<Arc<AdmissionGate>>,
    metrics: Arc<Metrics>,
    /// Cleared to stop accepting new connections
    accepting: Arc<AtomicBool>,
    /// Set to stop the event loops
    quit: Arc<AtomicBool>,
    /// Requests currently being handled
    in_flight: Arc<AtomicUsize>,
    acceptors: Vec<JoinHandle<()>>,
    loops: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the listeners and start every loop.
    ///
    /// Fails only on startup problems: the readiness facility cannot be
    /// created or a listener cannot be bound.
    pub fn start(config: ServerConfig, events: Receiver<String>) -> Result<Self, Box<dyn std::error::Error>> {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::with_timeout(config.poll_timeout)?);
        let engine = Arc::new(BroadcastEngine::new(
            registry,
            Arc::clone(&metrics),
            config.max_workers,
        ));
        let gate = config
            .csrf_protection
            .then(|| Arc::new(AdmissionGate::new(config.token_ttl)));

        let accepting = Arc::new(AtomicBool::new(true));
        let quit = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));

        // Listeners first: nothing is spawned if a port is taken
        let listener = bind_listener(config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let debug_listener = match config.debug_addr {
            Some(addr) => Some(bind_listener(addr)?),
            None => None,
        };
        let debug_addr = match &debug_listener {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };

        log::info!("Server listening on {}", local_addr);
        log::info!("  Admission gate: {}", if gate.is_some() { "enabled" } else { "disabled" });
        if let Some(addr) = debug_addr {
            log::info!("  Debug endpoint: http://{}/metrics", addr);
        }

        let mut acceptors = Vec::new();
        let mut loops = Vec::new();

        let ctx = Arc::new(HandshakeContext {
            engine: Arc::clone(&engine),
            gate: gate.clone(),
            metrics: Arc::clone(&metrics),
            watcher_capacity: config.watcher_capacity,
            max_write_buffer: config.max_write_buffer,
        });
        let handler: RequestHandler = Arc::new(move |stream, peer| handshake::handle(stream, peer, &ctx));
        acceptors.push(spawn_acceptor(
            "acceptor",
            listener,
            handler,
            Arc::clone(&accepting),
            Arc::clone(&in_flight),
        )?);

        if let Some(listener) = debug_listener {
            let engine = Arc::clone(&engine);
            let metrics = Arc::clone(&metrics);
            let handler: RequestHandler = Arc::new(move |stream, peer| serve_debug(stream, peer, &engine, &metrics));
            acceptors.push(spawn_acceptor(
                "debug",
                listener,
                handler,
                Arc::clone(&accepting),
                Arc::clone(&in_flight),
            )?);
        }

        {
            let engine = Arc::clone(&engine);
            let quit = Arc::clone(&quit);
            loops.push(
                thread::Builder::new()
                    .name("fanout".into())
                    .spawn(move || engine.run_fanout(&events, &quit))?,
            );
        }
        {
            let engine = Arc::clone(&engine);
            let quit = Arc::clone(&quit);
            loops.push(
                thread::Builder::new()
                    .name("delivery".into())
                    .spawn(move || engine.run_delivery(&quit))?,
            );
        }
        if let Some(gate) = &gate {
            let gate = Arc::clone(gate);
            let quit = Arc::clone(&quit);
            let metrics = Arc::clone(&metrics);
            let interval = config.reap_interval;
            loops.push(thread::Builder::new().name("reaper".into()).spawn(move || {
                gate.run_reaper(interval, &quit, |n| {
                    metrics.tokens_expired_total.fetch_add(n as u64, Ordering::Relaxed);
                })
            })?);
        }

        Ok(Server {
            config,
            local_addr,
            debug_addr,
            engine,
            gate,
            metrics,
            accepting,
            quit,
            in_flight,
            acceptors,
            loops,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn debug_addr(&self) -> Option<SocketAddr> {
        self.debug_addr
    }

    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    pub fn gate(&self) -> Option<&Arc<AdmissionGate>> {
        self.gate.as_ref()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Block until `signal` is set, then shut down gracefully
    pub fn run_until(self, signal: &AtomicBool) {
        while !signal.load(Ordering::Acquire) {
            thread::sleep(ACCEPT_TICK);
        }
        log::info!("Shutdown requested");
        self.stop();
    }

    /// Graceful shutdown: stop accepting, let in-flight requests finish
    /// within the grace period, stop and join every loop, then close all
    /// remaining client connections.
    pub fn stop(self) {
        self.accepting.store(false, Ordering::Release);
        for handle in self.acceptors {
            if handle.join().is_err() {
                log::error!("Acceptor thread panicked");
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                log::warn!(
                    "{} requests still in flight after {:?}",
                    self.in_flight.load(Ordering::Acquire),
                    self.config.shutdown_grace
                );
                break;
            }
            thread::sleep(DRAIN_TICK);
        }

        self.quit.store(true, Ordering::Release);
        if let Err(e) = self.engine.registry().wake() {
            log::debug!("Failed to wake delivery loop: {}", e);
        }
        for handle in self.loops {
            if handle.join().is_err() {
                log::error!("Event loop thread panicked");
            }
        }

        let closed = self.engine.shutdown();
        log::info!("Server stopped ({} connections closed)", closed);
    }
}

// ============================================================================
// Acceptor
// ============================================================================

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Decrements the in-flight counter when a request thread ends
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        InFlight(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Poll a non-blocking listener and hand every accepted connection to
/// `handler` on its own thread. The listener is closed when the thread
/// exits.
fn spawn_acceptor(
    name: &str,
    listener: TcpListener,
    handler: RequestHandler,
    accepting: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
) -> io::Result<JoinHandle<()>> {
    let mut poll = Poll::new()?;
    let fd = listener.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;

    let name = name.to_string();
    thread::Builder::new().name(name.clone()).spawn(move || {
        let mut events = Events::with_capacity(16);

        while accepting.load(Ordering::Acquire) {
            if let Err(e) = poll.poll(&mut events, Some(ACCEPT_TICK)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("{}: poll failed: {}", name, e);
                }
                continue;
            }
            if events.is_empty() {
                continue;
            }

            // Edge-triggered: accept until the backlog is empty
            loop {
                let (stream, peer) = match listener.accept() {
                    Ok(v) => v,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("{}: accept failed: {}", name, e);
                        break;
                    }
                };
                if let Err(e) = stream.set_nonblocking(false) {
                    log::debug!("{}: dropping {}: {}", name, peer, e);
                    continue;
                }

                let guard = InFlight::enter(&in_flight);
                let handler = Arc::clone(&handler);
                let spawned = thread::Builder::new().name(format!("{}-req", name)).spawn(move || {
                    let _guard = guard;
                    handler(stream, peer);
                });
                if let Err(e) = spawned {
                    log::error!("{}: failed to spawn request thread for {}: {}", name, peer, e);
                }
            }
        }

        log::debug!("{}: stopped accepting", name);
    })
}

// ============================================================================
// Debug Endpoint
// ============================================================================

/// `GET /metrics` (Prometheus text) and `GET /debug/sessions` (JSON)
fn serve_debug(mut stream: TcpStream, peer: SocketAddr, engine: &BroadcastEngine, metrics: &Metrics) {
    let result = (|| -> Result<(), HandshakeError> {
        stream.set_read_timeout(Some(handshake::HTTP_TIMEOUT))?;
        stream.set_write_timeout(Some(handshake::HTTP_TIMEOUT))?;
        let (request, _) = handshake::read_request(&mut stream)?;

        match request.uri().path() {
            "/metrics" => handshake::write_response(
                &mut stream,
                StatusCode::OK,
                "text/plain; version=0.0.4",
                &metrics.render(),
            )?,
            "/debug/sessions" => {
                let body = serde_json::to_string(&engine.session_stats())
                    .map_err(|e| HandshakeError::BadRequest(e.to_string()))?;
                handshake::write_response(&mut stream, StatusCode::OK, "application/json", &body)?
            }
            path => return Err(HandshakeError::NotFound(path.to_string())),
        }
        Ok(())
    })();

    if let Err(e) = result {
        log::debug!("Debug request from {} failed: {}", peer, e);
        if let Some(status) = e.status() {
            let _ = handshake::write_response(&mut stream, status, "text/plain", &e.to_string());
        }
    }
}
