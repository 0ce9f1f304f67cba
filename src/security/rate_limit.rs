//! Per-client rate limiting
//!
//! Fixed window counter keyed by [`ClientIdentity`]. Each identity gets its
//! own window, anchored at its first request; once the window duration has
//! elapsed the count starts over.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Who a request is charged to. Token identity is preferred once a client
/// has authenticated; otherwise the remote address is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    Token(String),
    Address(String),
}

impl ClientIdentity {
    /// Identity derived from a bearer token. Only a fingerprint is kept.
    pub fn token(token: &str) -> Self {
        let digest = Sha256::digest(token.as_bytes());
        let fingerprint: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
        ClientIdentity::Token(fingerprint)
    }

    pub fn address(remote: impl Into<String>) -> Self {
        ClientIdentity::Address(remote.into())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::Token(fp) => write!(f, "token:{}", fp),
            ClientIdentity::Address(addr) => write!(f, "ip:{}", addr),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<ClientIdentity, RateWindow>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, identity: &ClientIdentity) -> bool {
        self.check(identity).is_ok()
    }

    /// Count a request against `identity`.
    ///
    /// Returns the time left in the current window when the limit is
    /// already reached. Rejected calls are not counted.
    pub fn check(&self, identity: &ClientIdentity) -> Result<(), Duration> {
        self.check_at(identity, Instant::now())
    }

    pub(crate) fn check_at(&self, identity: &ClientIdentity, now: Instant) -> Result<(), Duration> {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let state = windows.entry(identity.clone()).or_insert(RateWindow {
            window_start: now,
            count: 0,
        });

        if now.saturating_duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count >= self.limit {
            let elapsed = now.saturating_duration_since(state.window_start);
            let retry_after = self.window.saturating_sub(elapsed);
            warn!(
                identity = %identity,
                count = state.count,
                limit = self.limit,
                "Rate limit exceeded"
            );
            return Err(retry_after);
        }

        state.count += 1;
        Ok(())
    }

    /// Requests left for `identity` in its current window.
    pub fn remaining(&self, identity: &ClientIdentity) -> u32 {
        let windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match windows.get(identity) {
            Some(state) if state.window_start.elapsed() < self.window => {
                self.limit.saturating_sub(state.count)
            }
            _ => self.limit,
        }
    }

    /// Forget identities whose window has run out.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub(crate) fn prune_at(&self, now: Instant) -> usize {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, state| now.saturating_duration_since(state.window_start) < self.window);
        before - windows.len()
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
