//! Fanout Server
//!
//! Broadcasts a stream of upstream events to every connected WebSocket
//! client. Connections are watched through a single readiness facility and
//! served by a bounded pool of short-lived delivery units.

pub mod auth;
pub mod client;
pub mod config;
pub mod engine;
pub mod handshake;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod source;
pub mod watcher;

pub use auth::AdmissionGate;
pub use client::{Connection, ConnectionId};
pub use config::ServerConfig;
pub use engine::{BroadcastEngine, SessionStats};
pub use metrics::Metrics;
pub use registry::{ConnectionRegistry, RegistryError};
pub use server::Server;
pub use watcher::{QueueWatcher, Watcher};
