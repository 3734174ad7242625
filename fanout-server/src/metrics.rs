//! Lightweight Prometheus-compatible metrics for the Fanout Server.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format for the debug endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the Fanout Server.
pub struct Metrics {
    /// Currently bound WebSocket connections (gauge)
    pub active_connections: AtomicU64,
    /// Completed WebSocket handshakes (counter)
    pub handshakes_total: AtomicU64,
    /// Handshakes refused by the admission gate or failed upgrades (counter)
    pub handshake_rejections_total: AtomicU64,
    /// Upstream events fanned out to watchers (counter)
    pub events_fanned_out_total: AtomicU64,
    /// Messages written to client sockets (counter)
    pub messages_delivered_total: AtomicU64,
    /// Connections torn down after an unexpected I/O error (counter)
    pub delivery_errors_total: AtomicU64,
    /// Admission tokens handed out (counter)
    pub tokens_issued_total: AtomicU64,
    /// Admission tokens consumed by a handshake (counter)
    pub tokens_consumed_total: AtomicU64,
    /// Admission tokens removed by the reaper (counter)
    pub tokens_expired_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshake_rejections_total: AtomicU64::new(0),
            events_fanned_out_total: AtomicU64::new(0),
            messages_delivered_total: AtomicU64::new(0),
            delivery_errors_total: AtomicU64::new(0),
            tokens_issued_total: AtomicU64::new(0),
            tokens_consumed_total: AtomicU64::new(0),
            tokens_expired_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP fanout_active_connections Current number of bound WebSocket connections\n\
             # TYPE fanout_active_connections gauge\n\
             fanout_active_connections {}\n\
             # HELP fanout_handshakes_total Total completed WebSocket handshakes\n\
             # TYPE fanout_handshakes_total counter\n\
             fanout_handshakes_total {}\n\
             # HELP fanout_handshake_rejections_total Total refused or failed handshakes\n\
             # TYPE fanout_handshake_rejections_total counter\n\
             fanout_handshake_rejections_total {}\n\
             # HELP fanout_events_fanned_out_total Total upstream events fanned out\n\
             # TYPE fanout_events_fanned_out_total counter\n\
             fanout_events_fanned_out_total {}\n\
             # HELP fanout_messages_delivered_total Total messages written to clients\n\
             # TYPE fanout_messages_delivered_total counter\n\
             fanout_messages_delivered_total {}\n\
             # HELP fanout_delivery_errors_total Total connections lost to unexpected I/O errors\n\
             # TYPE fanout_delivery_errors_total counter\n\
             fanout_delivery_errors_total {}\n\
             # HELP fanout_tokens_issued_total Total admission tokens issued\n\
             # TYPE fanout_tokens_issued_total counter\n\
             fanout_tokens_issued_total {}\n\
             # HELP fanout_tokens_consumed_total Total admission tokens consumed\n\
             # TYPE fanout_tokens_consumed_total counter\n\
             fanout_tokens_consumed_total {}\n\
             # HELP fanout_tokens_expired_total Total admission tokens reaped after TTL\n\
             # TYPE fanout_tokens_expired_total counter\n\
             fanout_tokens_expired_total {}\n\
             # HELP fanout_uptime_seconds Server uptime in seconds\n\
             # TYPE fanout_uptime_seconds gauge\n\
             fanout_uptime_seconds {}\n",
            self.active_connections.load(Ordering::Relaxed),
            self.handshakes_total.load(Ordering::Relaxed),
            self.handshake_rejections_total.load(Ordering::Relaxed),
            self.events_fanned_out_total.load(Ordering::Relaxed),
            self.messages_delivered_total.load(Ordering::Relaxed),
            self.delivery_errors_total.load(Ordering::Relaxed),
            self.tokens_issued_total.load(Ordering::Relaxed),
            self.tokens_consumed_total.load(Ordering::Relaxed),
            self.tokens_expired_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
