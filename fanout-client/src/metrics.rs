//! Counters shared by every client thread.
//!
//! Rendered in Prometheus text format when the client exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Successful WebSocket handshakes (counter)
    pub connections_total: AtomicU64,
    /// Connect or handshake failures (counter)
    pub connection_failures_total: AtomicU64,
    /// Events received across all clients (counter)
    pub messages_received_total: AtomicU64,
    /// Client threads that have finished, for any reason (counter)
    pub disconnections_total: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connection_failures_total: AtomicU64::new(0),
            messages_received_total: AtomicU64::new(0),
            disconnections_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Clients currently holding an open connection
    pub fn connected(&self) -> u64 {
        let opened = self.connections_total.load(Ordering::Relaxed);
        let failed = self.connection_failures_total.load(Ordering::Relaxed);
        let gone = self.disconnections_total.load(Ordering::Relaxed);
        // Failed attempts are counted as disconnections too
        (opened + failed).saturating_sub(gone)
    }

    pub fn render(&self) -> String {
        format!(
            "# HELP fanout_client_connections_total Successful WebSocket handshakes\n\
             # TYPE fanout_client_connections_total counter\n\
             fanout_client_connections_total {}\n\
             # HELP fanout_client_connection_failures_total Failed connection attempts\n\
             # TYPE fanout_client_connection_failures_total counter\n\
             fanout_client_connection_failures_total {}\n\
             # HELP fanout_client_messages_received_total Events received\n\
             # TYPE fanout_client_messages_received_total counter\n\
             fanout_client_messages_received_total {}\n\
             # HELP fanout_client_disconnections_total Finished client connections\n\
             # TYPE fanout_client_disconnections_total counter\n\
             fanout_client_disconnections_total {}\n\
             # HELP fanout_client_uptime_seconds Client uptime in seconds\n\
             # TYPE fanout_client_uptime_seconds gauge\n\
             fanout_client_uptime_seconds {}\n",
            self.connections_total.load(Ordering::Relaxed),
            self.connection_failures_total.load(Ordering::Relaxed),
            self.messages_received_total.load(Ordering::Relaxed),
            self.disconnections_total.load(Ordering::Relaxed),
            self.start_time.elapsed().as_secs(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
