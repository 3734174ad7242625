//! Connected WebSocket clients of the Fanout Server

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tungstenite::protocol::WebSocketConfig;
use tungstenite::WebSocket;

/// Source of process-unique connection ids
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Default cap on frames buffered in user space for one client
pub const DEFAULT_MAX_WRITE_BUFFER: usize = 1024 * 1024;

/// WebSocket settings for an accepted client.
///
/// The write buffer is bounded so a peer that stops reading cannot make the
/// server buffer without limit; the cap is kept above tungstenite's write
/// buffer size, which it must exceed.
pub fn websocket_config(max_write_buffer: usize) -> WebSocketConfig {
    let defaults = WebSocketConfig::default();
    let floor = defaults.write_buffer_size * 2;
    defaults.max_write_buffer_size(max_write_buffer.max(floor))
}

// ============================================================================
// Connection Id
// ============================================================================

/// Process-unique identifier of an upgraded connection.
///
/// Raw descriptors are recycled by the kernel as soon as a socket closes, so
/// bindings are keyed by this id instead of the fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// An upgraded, non-blocking WebSocket connection
pub struct Connection {
    /// Unique id (stable for the lifetime of the process)
    id: ConnectionId,
    /// Raw descriptor captured at upgrade time (for the readiness registry)
    fd: RawFd,
    /// Remote peer address
    peer: SocketAddr,
    /// The WebSocket; locked only for non-blocking reads and writes
    socket: Mutex<WebSocket<TcpStream>>,
    /// Set by the first path that tears the connection down
    torn_down: AtomicBool,
    /// The kernel refused the last write; cleared once a flush completes
    write_blocked: AtomicBool,
}

impl Connection {
    /// Wrap an upgraded WebSocket. The underlying stream should already be
    /// in non-blocking mode.
    pub fn new(socket: WebSocket<TcpStream>, peer: SocketAddr) -> Self {
        let fd = socket.get_ref().as_raw_fd();
        Connection {
            id: ConnectionId::next(),
            fd,
            peer,
            socket: Mutex::new(socket),
            torn_down: AtomicBool::new(false),
            write_blocked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Lock the WebSocket for a single non-blocking I/O step
    pub fn socket(&self) -> MutexGuard<'_, WebSocket<TcpStream>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim teardown ownership.
    ///
    /// Returns true for exactly one caller over the lifetime of the
    /// connection, no matter how many paths observe its termination.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Whether frames are waiting in user space for the socket to drain
    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_blocked(&self, blocked: bool) {
        self.write_blocked.store(blocked, Ordering::Release);
    }

    /// Best-effort close frame followed by a socket shutdown.
    ///
    /// The descriptor itself is released when the last handle is dropped.
    pub fn close(&self) {
        let mut socket = self.socket();
        let _ = socket.close(None);
        let _ = socket.flush();
        if let Err(e) = socket.get_ref().shutdown(Shutdown::Both) {
            log::trace!("Shutdown of {} failed: {}", self.id, e);
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("torn_down", &self.is_torn_down())
            .field("write_blocked", &self.is_write_blocked())
            .finish()
    }
}

/// Build a server-side connection over one end of a loopback TCP pair.
///
/// Returns the connection and the peer's client stream. No WebSocket
/// handshake is performed; callers speak raw frames if they need to.
#[cfg(test)]
pub(crate) fn loopback_pair() -> (Connection, TcpStream) {
    use std::net::TcpListener;
    use tungstenite::protocol::Role;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, peer) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    let config = websocket_config(DEFAULT_MAX_WRITE_BUFFER);
    let socket = WebSocket::from_raw_socket(server, Role::Server, Some(config));
    (Connection::new(socket, peer), client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _ca) = loopback_pair();
        let (b, _cb) = loopback_pair();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
    }

    #[test]
    fn test_begin_teardown_once() {
        let (conn, _client) = loopback_pair();
        assert!(!conn.is_torn_down());
        assert!(conn.begin_teardown());
        assert!(!conn.begin_teardown());
        assert!(conn.is_torn_down());
    }

    #[test]
    fn test_websocket_config_bounds_write_buffer() {
        let config = websocket_config(DEFAULT_MAX_WRITE_BUFFER);
        assert_eq!(config.max_write_buffer_size, DEFAULT_MAX_WRITE_BUFFER);

        // Never below what tungstenite needs to make progress
        let tiny = websocket_config(1);
        assert!(tiny.max_write_buffer_size > tiny.write_buffer_size);
        assert!(tiny.max_write_buffer_size < usize::MAX);
    }

    #[test]
    fn test_close_shuts_down_peer() {
        use std::io::Read;
        use std::time::Duration;

        let (conn, mut client) = loopback_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        conn.close();

        // Close frame (if it made it out) followed by EOF
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).unwrap();
        assert_eq!(n, buf.len());
    }
}
