//! HTTP front door: request parsing, routing and the WebSocket upgrade
//!
//! The upgrade is performed directly on the accepted `TcpStream` so the raw
//! descriptor stays reachable through `AsRawFd`; tungstenite is only asked to
//! validate the request, build the `101` response and frame messages
//! afterwards.
//!
//! Routes:
//!   GET /goapp/health        -> 200 "OK"
//!   GET /goapp               -> home page (issues an admission token when gated)
//!   GET /goapp/ws            -> upgrade (admission gate disabled)
//!   GET /goapp/ws/{token}    -> upgrade (admission gate enabled)

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tungstenite::handshake::server::{create_response, Request, Response};
use tungstenite::http::{Method, StatusCode, Version};
use tungstenite::protocol::Role;
use tungstenite::WebSocket;

use crate::auth::AdmissionGate;
use crate::client::{websocket_config, Connection, ConnectionId};
use crate::engine::BroadcastEngine;
use crate::metrics::Metrics;
use crate::registry::RegistryError;
use crate::watcher::{QueueWatcher, Watcher, WatcherError};

// ============================================================================
// Constants
// ============================================================================

pub const HEALTH_PATH: &str = "/goapp/health";
pub const HOME_PATH: &str = "/goapp";
pub const WS_PATH: &str = "/goapp/ws";

/// Upper bound on the size of a request head
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Upper bound on the number of request headers
const MAX_HEADERS: usize = 32;

/// Read/write timeout while the request is still plain HTTP
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const HOME_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>fanout</title></head>
<body>
<pre id="events"></pre>
<script>
const scheme = location.protocol === "https:" ? "wss://" : "ws://";
const ws = new WebSocket(scheme + location.host + "{ws_path}");
const out = document.getElementById("events");
ws.onmessage = (e) => { out.textContent += JSON.parse(e.data) + "\n"; };
ws.onclose = () => { out.textContent += "-- disconnected --\n"; };
</script>
</body>
</html>
"#;

// ============================================================================
// Errors
// ============================================================================

/// Errors terminating a single HTTP request or handshake
#[derive(Debug)]
pub enum HandshakeError {
    /// Socket error (nothing more can be sent)
    Io(io::Error),
    /// Malformed or oversized request head
    BadRequest(String),
    /// No route for the path
    NotFound(String),
    /// Route exists but not for this method
    MethodNotAllowed(Method),
    /// Admission token missing, unknown, expired or already used
    Forbidden(&'static str),
    /// The request is not a valid WebSocket upgrade
    Upgrade(String),
    /// The watcher for the new client could not be started
    Watcher(WatcherError),
    /// The connection could not be registered for readiness
    Registry(RegistryError),
}

impl HandshakeError {
    /// HTTP status to answer with, if the socket still speaks HTTP
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HandshakeError::BadRequest(_) | HandshakeError::Upgrade(_) => Some(StatusCode::BAD_REQUEST),
            HandshakeError::NotFound(_) => Some(StatusCode::NOT_FOUND),
            HandshakeError::MethodNotAllowed(_) => Some(StatusCode::METHOD_NOT_ALLOWED),
            HandshakeError::Forbidden(_) => Some(StatusCode::FORBIDDEN),
            // Already upgraded, or the socket is gone
            HandshakeError::Io(_) | HandshakeError::Watcher(_) | HandshakeError::Registry(_) => None,
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Io(e) => write!(f, "i/o error: {}", e),
            HandshakeError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            HandshakeError::NotFound(path) => write!(f, "no route for {}", path),
            HandshakeError::MethodNotAllowed(m) => write!(f, "method {} not allowed", m),
            HandshakeError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            HandshakeError::Upgrade(msg) => write!(f, "upgrade failed: {}", msg),
            HandshakeError::Watcher(e) => write!(f, "failed to start watcher: {}", e),
            HandshakeError::Registry(e) => write!(f, "failed to register connection: {}", e),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Io(e) => Some(e),
            HandshakeError::Watcher(e) => Some(e),
            HandshakeError::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        HandshakeError::Io(e)
    }
}

impl From<WatcherError> for HandshakeError {
    fn from(e: WatcherError) -> Self {
        HandshakeError::Watcher(e)
    }
}

impl From<RegistryError> for HandshakeError {
    fn from(e: RegistryError) -> Self {
        HandshakeError::Registry(e)
    }
}

// ============================================================================
// Request Parsing
// ============================================================================

/// Read until the request head is complete and parse it.
///
/// Returns the request and any bytes the client sent past the head.
pub fn read_request<R: Read>(stream: &mut R) -> Result<(Request, Vec<u8>), HandshakeError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(HandshakeError::BadRequest("connection closed before end of head".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((request, head_len)) = parse_head(&buf)? {
            let leftover = buf.split_off(head_len);
            return Ok((request, leftover));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HandshakeError::BadRequest("request head too large".into()));
        }
    }
}

/// Parse a request head into an `http::Request`.
///
/// `Ok(None)` means more bytes are needed; otherwise the length of the head
/// (blank line included) is returned alongside the request.
pub fn parse_head(buf: &[u8]) -> Result<Option<(Request, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HandshakeError::BadRequest(format!("malformed request head: {}", e))),
    };

    let version = match parsed.version {
        Some(1) => Version::HTTP_11,
        Some(0) => Version::HTTP_10,
        other => return Err(HandshakeError::BadRequest(format!("unsupported version {:?}", other))),
    };
    let method = parsed
        .method
        .ok_or_else(|| HandshakeError::BadRequest("missing method".into()))?;
    let target = parsed
        .path
        .ok_or_else(|| HandshakeError::BadRequest("missing request target".into()))?;

    let mut builder = Request::builder().method(method).uri(target).version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    builder
        .body(())
        .map(|request| Some((request, head_len)))
        .map_err(|e| HandshakeError::BadRequest(e.to_string()))
}

// ============================================================================
// Routing
// ============================================================================

/// Where a request goes
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Health,
    Home,
    Upgrade { token: Option<String> },
}

/// Resolve a request to a route. With the gate enabled the upgrade path
/// carries the token as its last segment.
pub fn route(method: &Method, path: &str, gated: bool) -> Result<Route, HandshakeError> {
    let route = if path == HEALTH_PATH {
        Route::Health
    } else if path == HOME_PATH || path == "/goapp/" {
        Route::Home
    } else if path == WS_PATH {
        Route::Upgrade { token: None }
    } else if let Some(token) = path.strip_prefix("/goapp/ws/").filter(|_| gated) {
        if token.is_empty() || token.contains('/') {
            return Err(HandshakeError::NotFound(path.to_string()));
        }
        Route::Upgrade {
            token: Some(token.to_string()),
        }
    } else {
        return Err(HandshakeError::NotFound(path.to_string()));
    };

    if *method != Method::GET {
        return Err(HandshakeError::MethodNotAllowed(method.clone()));
    }
    Ok(route)
}

// ============================================================================
// Responses
// ============================================================================

/// Write a complete plain HTTP response and ask the client to close
pub fn write_response<W: Write>(
    stream: &mut W,
    status: StatusCode,
    content_type: &str,
    body: &str,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

fn write_upgrade_response<W: Write>(stream: &mut W, response: &Response) -> io::Result<()> {
    let mut out = Vec::with_capacity(256);
    write!(
        out,
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    )?;
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    stream.write_all(&out)?;
    stream.flush()
}

/// Home page pointing the browser at the upgrade path
pub fn home_page(ws_path: &str) -> String {
    HOME_PAGE.replace("{ws_path}", ws_path)
}

// ============================================================================
// Handler
// ============================================================================

/// Everything a request handler needs from the server
pub struct HandshakeContext {
    pub engine: Arc<BroadcastEngine>,
    pub gate: Option<Arc<AdmissionGate>>,
    pub metrics: Arc<Metrics>,
    pub watcher_capacity: usize,
    /// Cap on frames buffered in user space per client
    pub max_write_buffer: usize,
}

/// What a successfully handled request turned into
#[derive(Debug, Clone, PartialEq)]
pub enum Served {
    Health,
    Home,
    Upgraded(ConnectionId),
}

/// Handle one accepted TCP connection.
///
/// Errors and panics are answered while the socket still speaks HTTP and
/// logged here; nothing propagates to the acceptor.
pub fn handle(stream: TcpStream, peer: SocketAddr, ctx: &HandshakeContext) {
    let mut reply = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to clone stream from {}: {}", peer, e);
            return;
        }
    };
    let upgraded = AtomicBool::new(false);

    match panic::catch_unwind(AssertUnwindSafe(|| serve(stream, peer, ctx, &upgraded))) {
        Ok(Ok(served)) => log::trace!("Served {:?} for {}", served, peer),
        Ok(Err(e)) => {
            match &e {
                HandshakeError::Io(_) => log::debug!("Request from {} failed: {}", peer, e),
                _ => log::info!("Request from {} rejected: {}", peer, e),
            }
            if let Some(status) = e.status() {
                reject(&mut reply, upgraded.load(Ordering::Acquire), status, &e.to_string());
            }
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("Panic while handling request from {}: {}", peer, msg);
            reject(
                &mut reply,
                upgraded.load(Ordering::Acquire),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
            );
        }
    }
}

/// Answer a failed request with `status`. Once the `101` has gone out the
/// peer speaks WebSocket, so the socket is only shut down.
fn reject(reply: &mut TcpStream, upgraded: bool, status: StatusCode, body: &str) {
    if upgraded {
        let _ = reply.shutdown(Shutdown::Both);
        return;
    }
    let _ = write_response(reply, status, "text/plain; charset=utf-8", body);
}

/// Read, route and answer a single request.
///
/// `upgraded` is set as soon as the `101` starts going out.
pub fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: &HandshakeContext,
    upgraded: &AtomicBool,
) -> Result<Served, HandshakeError> {
    stream.set_read_timeout(Some(HTTP_TIMEOUT))?;
    stream.set_write_timeout(Some(HTTP_TIMEOUT))?;

    let (request, leftover) = read_request(&mut stream)?;

    match route(request.method(), request.uri().path(), ctx.gate.is_some())? {
        Route::Health => {
            write_response(&mut stream, StatusCode::OK, "text/plain; charset=utf-8", "OK")?;
            Ok(Served::Health)
        }
        Route::Home => {
            let ws_path = match &ctx.gate {
                Some(gate) => {
                    let token = gate.issue().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                    ctx.metrics.tokens_issued_total.fetch_add(1, Ordering::Relaxed);
                    format!("{}/{}", WS_PATH, token)
                }
                None => WS_PATH.to_string(),
            };
            write_response(&mut stream, StatusCode::OK, "text/html; charset=utf-8", &home_page(&ws_path))?;
            Ok(Served::Home)
        }
        Route::Upgrade { token } => match upgrade(stream, peer, &request, leftover, token, ctx, upgraded) {
            Ok(id) => {
                ctx.metrics.handshakes_total.fetch_add(1, Ordering::Relaxed);
                Ok(Served::Upgraded(id))
            }
            Err(e) => {
                ctx.metrics.handshake_rejections_total.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        },
    }
}

/// Admission check, protocol upgrade, watcher start and binding.
///
/// Every failure returns immediately; once the `101` has been written the
/// socket is closed before returning.
fn upgrade(
    mut stream: TcpStream,
    peer: SocketAddr,
    request: &Request,
    leftover: Vec<u8>,
    token: Option<String>,
    ctx: &HandshakeContext,
    upgraded: &AtomicBool,
) -> Result<ConnectionId, HandshakeError> {
    if let Some(gate) = &ctx.gate {
        let token = token.ok_or(HandshakeError::Forbidden("missing admission token"))?;
        // Deleted now so the token cannot admit a second connection
        if !gate.validate_and_consume(&token) {
            return Err(HandshakeError::Forbidden("bad admission token"));
        }
        ctx.metrics.tokens_consumed_total.fetch_add(1, Ordering::Relaxed);
    }

    let response = create_response(request).map_err(|e| HandshakeError::Upgrade(e.to_string()))?;
    upgraded.store(true, Ordering::Release);
    write_upgrade_response(&mut stream, &response)?;

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;

    let config = websocket_config(ctx.max_write_buffer);
    let socket = WebSocket::from_partially_read(stream, leftover, Role::Server, Some(config));
    let conn = Arc::new(Connection::new(socket, peer));

    let watcher = match start_watcher(ctx.watcher_capacity) {
        Ok(w) => w,
        Err(e) => {
            conn.close();
            return Err(e.into());
        }
    };

    if let Err(e) = ctx.engine.bind(Arc::clone(&conn), watcher.clone()) {
        watcher.stop();
        conn.close();
        return Err(e.into());
    }

    Ok(conn.id())
}

fn start_watcher(capacity: usize) -> Result<Arc<QueueWatcher>, WatcherError> {
    let watcher = QueueWatcher::new(capacity)?;
    watcher.start()?;
    Ok(Arc::new(watcher))
}
