//! Fanout Client
//!
//! Opens N parallel WebSocket connections to a Fanout Server and reads events
//! until the server goes away or the process is interrupted:
//! - one thread per connection (5s connect/handshake timeout)
//! - per-client activity logged to a file (debug with -v, errors otherwise)
//! - progress printed as clients disconnect

use std::fmt;
use std::fs::File;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tungstenite::http::Uri;
use tungstenite::{Message, WebSocket};

mod metrics;

use metrics::Metrics;

// ============================================================================
// Constants
// ============================================================================

/// Default server endpoint
const DEFAULT_URL: &str = "ws://localhost:8080/goapp/ws";

/// Default log file
const DEFAULT_LOG_FILE: &str = "client.log";

/// TCP connect and WebSocket handshake timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout once connected, bounds how late the exit flag is noticed
const READ_TICK: Duration = Duration::from_millis(200);

/// How long a closing client waits for the server's close reply
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
enum ClientError {
    /// Endpoint is not a usable ws:// URL
    Url(String),
    Io(io::Error),
    /// Server refused or botched the upgrade
    Handshake(String),
    WebSocket(tungstenite::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Url(msg) => write!(f, "bad url: {}", msg),
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            ClientError::WebSocket(e) => write!(f, "websocket error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        ClientError::WebSocket(e)
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct ClientConfig {
    /// Number of parallel connections
    count: usize,
    verbose: bool,
    url: String,
    log_file: String,
}

impl ClientConfig {
    // -n <N>             Number of parallel connections (default 1)
    // -v                 Log every received event
    // --url <ws://...>   Server endpoint
    // --log-file <path>  Where client activity is logged
    fn from_args(args: &[String]) -> Result<Self, Box<dyn std::error::Error>> {
        let count = match parse_arg(args, "-n") {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| format!("Invalid number of connections: {}", v))?,
            None if args.iter().any(|a| a == "-n") => return Err("Missing value for -n".into()),
            None => 1,
        };
        if count <= 0 {
            return Err("Number of connections must be a positive number".into());
        }

        Ok(ClientConfig {
            count: count as usize,
            verbose: args.iter().any(|a| a == "-v"),
            url: parse_arg(args, "--url").unwrap_or_else(|| DEFAULT_URL.to_string()),
            log_file: parse_arg(args, "--log-file").unwrap_or_else(|| DEFAULT_LOG_FILE.to_string()),
        })
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Host and port of a `ws://` endpoint
fn endpoint(url: &str) -> Result<(String, u16), ClientError> {
    let uri: Uri = url.parse().map_err(|e| ClientError::Url(format!("{}: {}", url, e)))?;
    match uri.scheme_str() {
        Some("ws") => {}
        other => return Err(ClientError::Url(format!("unsupported scheme {:?}", other))),
    }
    let host = uri
        .host()
        .ok_or_else(|| ClientError::Url(format!("{}: missing host", url)))?;
    Ok((host.to_string(), uri.port_u16().unwrap_or(80)))
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let config = ClientConfig::from_args(&args)?;

    // Initialize logging (to a file, the console is for progress)
    let file = File::create(&config.log_file)?;
    env_logger::Builder::new()
        .filter_level(if config.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Error
        })
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    println!("logs in: {}", config.log_file);

    // SIGINT/SIGTERM ask every client to close
    let exit = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&exit))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&exit))?;

    let metrics = Arc::new(Metrics::new());
    let (done_tx, done_rx) = mpsc::channel::<usize>();
    let mut handles = Vec::with_capacity(config.count);

    for id in 0..config.count {
        let url = config.url.clone();
        let exit = Arc::clone(&exit);
        let client_metrics = Arc::clone(&metrics);
        let done = done_tx.clone();

        let spawned = thread::Builder::new()
            .name(format!("client-{}", id))
            .spawn(move || {
                match panic::catch_unwind(AssertUnwindSafe(|| run_client(id, &url, &exit, &client_metrics))) {
                    Ok(Ok(received)) => log::debug!("client {} done after {} events", id, received),
                    Ok(Err(e)) => log::debug!("client {} disconnected: {}", id, e),
                    Err(_) => log::error!("client {} panicked", id),
                }
                client_metrics.disconnections_total.fetch_add(1, Ordering::Relaxed);
                let _ = done.send(id);
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                log::error!("failed to spawn client {}: {}", id, e);
                metrics.connection_failures_total.fetch_add(1, Ordering::Relaxed);
                metrics.disconnections_total.fetch_add(1, Ordering::Relaxed);
                let _ = done_tx.send(id);
            }
        }
    }
    drop(done_tx);

    let mut disconnected = 0;
    while disconnected < config.count {
        let id = match done_rx.recv() {
            Ok(id) => id,
            Err(_) => break,
        };
        disconnected += 1;
        log::debug!("client {} was disconnected", id);
        println!(
            "disconnected clients: {}/{} (connected: {}, events: {})",
            disconnected,
            config.count,
            metrics.connected(),
            metrics.messages_received_total.load(Ordering::Relaxed)
        );
    }

    for handle in handles {
        let _ = handle.join();
    }
    println!("all clients have been disconnected");
    if config.verbose {
        print!("{}", metrics.render());
    }
    Ok(())
}

// ============================================================================
// Client Connection
// ============================================================================

/// Connect and complete the WebSocket handshake
fn connect(url: &str) -> Result<WebSocket<TcpStream>, ClientError> {
    let (host, port) = endpoint(url)?;
    let addr = (host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ClientError::Url(format!("cannot resolve {}", host)))?;

    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
    stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;

    let (ws, _) = tungstenite::client(url, stream).map_err(|e| ClientError::Handshake(e.to_string()))?;
    ws.get_ref().set_read_timeout(Some(READ_TICK))?;
    Ok(ws)
}

/// Read events until the server closes the connection or `exit` is set.
/// Returns the number of events received.
fn run_client(id: usize, url: &str, exit: &AtomicBool, metrics: &Metrics) -> Result<u64, ClientError> {
    let mut ws = match connect(url) {
        Ok(ws) => ws,
        Err(e) => {
            metrics.connection_failures_total.fetch_add(1, Ordering::Relaxed);
            log::debug!("client {} could not connect: {}", id, e);
            return Err(e);
        }
    };
    metrics.connections_total.fetch_add(1, Ordering::Relaxed);
    log::debug!("client {} connected", id);

    let mut received = 0;
    loop {
        if exit.load(Ordering::Acquire) {
            close(&mut ws);
            return Ok(received);
        }

        match ws.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<String>(text.as_str()) {
                Ok(event) => {
                    received += 1;
                    metrics.messages_received_total.fetch_add(1, Ordering::Relaxed);
                    log::debug!("from client {}: {}", id, event);
                }
                Err(e) => log::error!("client {}: bad payload {:?}: {}", id, text.as_str(), e),
            },
            Ok(Message::Close(frame)) => {
                log::debug!("client {}: server closed ({:?})", id, frame);
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return Ok(received);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Send a close frame and wait briefly for the server's reply
fn close(ws: &mut WebSocket<TcpStream>) {
    if ws.close(None).is_err() {
        return;
    }
    let deadline = Instant::now() + CLOSE_TIMEOUT;
    while Instant::now() < deadline {
        match ws.read() {
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(_) => break,
        }
    }
}
