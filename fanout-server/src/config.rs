//! Command line configuration for the Fanout Server
//!
//! --listen <addr:port>      HTTP/WebSocket listen address
//! --csrf                    Require a single-use admission token on upgrade
//! --token-ttl <secs>        Admission token lifetime
//! --reap-interval <secs>    Interval between expired-token sweeps
//! --event-interval <ms>     Interval of the built-in upstream generator
//! --watcher-capacity <n>    Events buffered per client before dropping
//! --max-workers <n>         Concurrent delivery units per batch
//! --max-write-buffer <bytes> Frames buffered per client once its socket is full
//! --debug-addr <addr|off>   Debug/metrics listener (local only)

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::{DEFAULT_REAP_INTERVAL, DEFAULT_TOKEN_TTL};
use crate::client::DEFAULT_MAX_WRITE_BUFFER;
use crate::engine::DEFAULT_MAX_WORKERS;
use crate::registry::DEFAULT_POLL_TIMEOUT;
use crate::source::DEFAULT_EVENT_INTERVAL;
use crate::watcher::DEFAULT_WATCHER_CAPACITY;

/// Default HTTP/WebSocket listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default debug listener address
pub const DEFAULT_DEBUG_ADDR: &str = "127.0.0.1:6060";

/// Grace period for in-flight requests at shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A flag value could not be parsed
    InvalidValue { flag: &'static str, value: String },
    /// A flag that needs a value was last on the command line
    MissingValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { flag, value } => {
                write!(f, "invalid value {:?} for {}", value, flag)
            }
            ConfigError::MissingValue(flag) => write!(f, "missing value for {}", flag),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub csrf_protection: bool,
    pub token_ttl: Duration,
    pub reap_interval: Duration,
    pub event_interval: Duration,
    pub watcher_capacity: usize,
    pub max_workers: usize,
    /// Bytes of frames buffered in user space per client
    pub max_write_buffer: usize,
    pub poll_timeout: Duration,
    pub shutdown_grace: Duration,
    /// `None` disables the debug listener
    pub debug_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            csrf_protection: false,
            token_ttl: DEFAULT_TOKEN_TTL,
            reap_interval: DEFAULT_REAP_INTERVAL,
            event_interval: DEFAULT_EVENT_INTERVAL,
            watcher_capacity: DEFAULT_WATCHER_CAPACITY,
            max_workers: DEFAULT_MAX_WORKERS,
            max_write_buffer: DEFAULT_MAX_WRITE_BUFFER,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            debug_addr: Some(SocketAddr::from(([127, 0, 0, 1], 6060))),
        }
    }
}

impl ServerConfig {
    /// Build a config from `std::env::args()`-style arguments
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();

        if let Some(v) = flag_value(args, "--listen")? {
            config.listen_addr = parse_value("--listen", &v)?;
        }
        config.csrf_protection = has_flag(args, "--csrf");
        if let Some(v) = flag_value(args, "--token-ttl")? {
            config.token_ttl = Duration::from_secs(parse_value("--token-ttl", &v)?);
        }
        if let Some(v) = flag_value(args, "--reap-interval")? {
            config.reap_interval = Duration::from_secs(parse_value("--reap-interval", &v)?);
        }
        if let Some(v) = flag_value(args, "--event-interval")? {
            config.event_interval = Duration::from_millis(parse_value("--event-interval", &v)?);
        }
        if let Some(v) = flag_value(args, "--watcher-capacity")? {
            config.watcher_capacity = parse_positive("--watcher-capacity", &v)?;
        }
        if let Some(v) = flag_value(args, "--max-workers")? {
            config.max_workers = parse_positive("--max-workers", &v)?;
        }
        if let Some(v) = flag_value(args, "--max-write-buffer")? {
            config.max_write_buffer = parse_positive("--max-write-buffer", &v)?;
        }
        if let Some(v) = flag_value(args, "--debug-addr")? {
            config.debug_addr = match v.as_str() {
                "off" | "none" | "" => None,
                _ => Some(parse_value("--debug-addr", &v)?),
            };
        }

        Ok(config)
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Value of `flag`, or an error if the flag is present without one
fn flag_value(args: &[String], flag: &'static str) -> Result<Option<String>, ConfigError> {
    match parse_arg(args, flag) {
        Some(v) => Ok(Some(v)),
        None if has_flag(args, flag) => Err(ConfigError::MissingValue(flag)),
        None => Ok(None),
    }
}

fn parse_value<T: std::str::FromStr>(flag: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        flag,
        value: value.to_string(),
    })
}

fn parse_positive(flag: &'static str, value: &str) -> Result<usize, ConfigError> {
    match parse_value::<usize>(flag, value)? {
        0 => Err(ConfigError::InvalidValue {
            flag,
            value: value.to_string(),
        }),
        n => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("fanout-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.debug_addr.map(|a| a.to_string()).as_deref(), Some(DEFAULT_DEBUG_ADDR));
        assert!(!config.csrf_protection);
        assert_eq!(config.token_ttl, Duration::from_secs(3600));
        assert_eq!(config.reap_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_all_flags() {
        let config = ServerConfig::from_args(&args(&[
            "--listen",
            "0.0.0.0:9000",
            "--csrf",
            "--token-ttl",
            "60",
            "--reap-interval",
            "5",
            "--event-interval",
            "250",
            "--watcher-capacity",
            "16",
            "--max-workers",
            "8",
            "--max-write-buffer",
            "524288",
            "--debug-addr",
            "off",
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert!(config.csrf_protection);
        assert_eq!(config.token_ttl, Duration::from_secs(60));
        assert_eq!(config.reap_interval, Duration::from_secs(5));
        assert_eq!(config.event_interval, Duration::from_millis(250));
        assert_eq!(config.watcher_capacity, 16);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.max_write_buffer, 512 * 1024);
        assert_eq!(config.debug_addr, None);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            ServerConfig::from_args(&args(&["--listen", "nowhere"])),
            Err(ConfigError::InvalidValue { flag: "--listen", .. })
        ));
        assert!(matches!(
            ServerConfig::from_args(&args(&["--max-workers", "0"])),
            Err(ConfigError::InvalidValue { flag: "--max-workers", .. })
        ));
        assert_eq!(
            ServerConfig::from_args(&args(&["--token-ttl"])),
            Err(ConfigError::MissingValue("--token-ttl"))
        );
    }
}
