//! Single-use admission tokens for the WebSocket handshake
//!
//! A token is issued when a client loads the home page and must appear as
//! the last path segment of the upgrade request. Tokens are valid for a
//! fixed TTL, and are deleted on first successful use or by the background
//! reaper once expired, whichever happens first.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Constants
// ============================================================================

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Default interval between reaper sweeps
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Random bytes per token (hex encoded on the wire)
const TOKEN_BYTES: usize = 16;

/// Granularity at which the reaper checks the quit flag
const REAPER_TICK: Duration = Duration::from_millis(200);

// ============================================================================
// Types
// ============================================================================

/// Errors while issuing tokens
#[derive(Debug)]
pub enum GateError {
    /// The system RNG failed
    Rng,
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::Rng => write!(f, "failed to generate admission token"),
        }
    }
}

impl std::error::Error for GateError {}

/// Store of outstanding admission tokens (`token -> issued_at` unix seconds)
pub struct AdmissionGate {
    tokens: RwLock<HashMap<String, u64>>,
    ttl: Duration,
    rng: SystemRandom,
}

/// Current wall-clock time in unix seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether a token issued at `issued_at` has outlived `ttl` at time `now`.
///
/// A token is still valid at exactly `issued_at + ttl`.
pub fn is_expired(issued_at: u64, ttl: Duration, now: u64) -> bool {
    now.saturating_sub(issued_at) > ttl.as_secs()
}

impl AdmissionGate {
    pub fn new(ttl: Duration) -> Self {
        AdmissionGate {
            tokens: RwLock::new(HashMap::new()),
            ttl,
            rng: SystemRandom::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Generate and record a fresh token
    pub fn issue(&self) -> Result<String, GateError> {
        self.issue_at(unix_now())
    }

    fn issue_at(&self, issued_at: u64) -> Result<String, GateError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng.fill(&mut bytes).map_err(|_| GateError::Rng)?;
        let token = hex::encode(bytes);

        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.clone(), issued_at);
        log::debug!("Issued admission token (ttl={}s)", self.ttl.as_secs());
        Ok(token)
    }

    /// True iff the token exists and has not expired
    pub fn validate(&self, token: &str) -> bool {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        match tokens.get(token) {
            Some(&issued_at) => !is_expired(issued_at, self.ttl, unix_now()),
            None => false,
        }
    }

    /// Delete the token unconditionally
    pub fn consume(&self, token: &str) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }

    /// Validate and delete in one step, so two racing handshakes presenting
    /// the same token cannot both be admitted.
    pub fn validate_and_consume(&self, token: &str) -> bool {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        match tokens.remove(token) {
            Some(issued_at) => !is_expired(issued_at, self.ttl, unix_now()),
            None => false,
        }
    }

    /// Delete every expired token; returns how many were removed
    pub fn reap_expired(&self) -> usize {
        let now = unix_now();
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        let before = tokens.len();
        tokens.retain(|_, issued_at| !is_expired(*issued_at, self.ttl, now));
        before - tokens.len()
    }

    /// Sweep expired tokens every `interval` until `quit` is set.
    ///
    /// `on_reaped` is told how many tokens each sweep removed.
    pub fn run_reaper(&self, interval: Duration, quit: &AtomicBool, on_reaped: impl Fn(usize)) {
        log::debug!("Token reaper running every {}s", interval.as_secs());
        let mut last_sweep = Instant::now();

        while !quit.load(Ordering::Acquire) {
            if last_sweep.elapsed() >= interval {
                let reaped = self.reap_expired();
                if reaped > 0 {
                    log::debug!("Reaped {} expired admission tokens", reaped);
                    on_reaped(reaped);
                }
                last_sweep = Instant::now();
            }
            std::thread::sleep(REAPER_TICK.min(interval));
        }
        log::debug!("Token reaper stopped");
    }

    pub fn len(&self) -> usize {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_issue_then_validate() {
        let gate = AdmissionGate::default();
        let token = gate.issue().unwrap();

        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(hex::decode(&token).is_ok());
        assert!(gate.validate(&token));
        // Validation alone does not use the token up
        assert!(gate.validate(&token));
    }

    #[test]
    fn test_consume_then_validate() {
        let gate = AdmissionGate::default();
        let token = gate.issue().unwrap();

        gate.consume(&token);
        assert!(!gate.validate(&token));
        assert!(gate.is_empty());
    }

    #[test]
    fn test_unknown_token_is_invalid() {
        let gate = AdmissionGate::default();
        assert!(!gate.validate("deadbeef"));
        assert!(!gate.validate(""));
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let gate = AdmissionGate::new(Duration::from_secs(60));
        let token = gate.issue_at(unix_now() - 61).unwrap();

        assert!(!gate.validate(&token));
        assert!(!gate.validate_and_consume(&token));
    }

    #[test]
    fn test_validate_and_consume_single_use() {
        let gate = AdmissionGate::default();
        let token = gate.issue().unwrap();

        assert!(gate.validate_and_consume(&token));
        assert!(!gate.validate_and_consume(&token));
    }

    #[test]
    fn test_is_expired_boundary() {
        let ttl = Duration::from_secs(3600);
        assert!(!is_expired(1000, ttl, 1000));
        assert!(!is_expired(1000, ttl, 4600));
        assert!(is_expired(1000, ttl, 4601));
        // Clock stepping backwards never expires a token
        assert!(!is_expired(1000, ttl, 10));
    }

    #[test]
    fn test_reap_expired_keeps_fresh_tokens() {
        let gate = AdmissionGate::new(Duration::from_secs(60));
        let fresh = gate.issue().unwrap();
        let _stale_a = gate.issue_at(unix_now() - 120).unwrap();
        let _stale_b = gate.issue_at(unix_now() - 61).unwrap();

        assert_eq!(gate.reap_expired(), 2);
        assert_eq!(gate.len(), 1);
        assert!(gate.validate(&fresh));
    }

    #[test]
    fn test_reaper_stops_on_quit() {
        let gate = Arc::new(AdmissionGate::new(Duration::from_secs(60)));
        gate.issue_at(unix_now() - 120).unwrap();
        let quit = Arc::new(AtomicBool::new(false));
        let reaped = Arc::new(AtomicUsize::new(0));

        let handle = {
            let gate = Arc::clone(&gate);
            let quit = Arc::clone(&quit);
            let reaped = Arc::clone(&reaped);
            std::thread::spawn(move || {
                gate.run_reaper(Duration::from_millis(10), &quit, |n| {
                    reaped.fetch_add(n, Ordering::SeqCst);
                })
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while reaped.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        quit.store(true, Ordering::Release);
        handle.join().unwrap();

        assert_eq!(reaped.load(Ordering::SeqCst), 1);
        assert!(gate.is_empty());
    }
}
