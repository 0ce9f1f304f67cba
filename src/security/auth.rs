//! Bearer-token authentication with address filtering and lockout
//!
//! Addresses that fail authentication `max_failed_attempts` times in a row
//! are blocked for the configured cooldown, during which even a correct
//! token is refused.

use crate::config::SecuritySettings;
use crate::session::ClientSession;
use crate::types::McpError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Address is temporarily blocked after repeated failures, retry after {retry_after_secs} seconds")]
    Blocked { retry_after_secs: u64 },

    #[error("Address not allowed")]
    AddressNotAllowed,

    #[error("Authentication token required")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken,
}

impl From<AuthError> for McpError {
    fn from(err: AuthError) -> Self {
        McpError::Unauthorized(err.to_string())
    }
}

/// One entry of the address allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    Exact(IpAddr),
    Network { base: IpAddr, prefix: u8 },
}

impl IpRule {
    /// Parse `"10.1.2.3"` or `"10.0.0.0/8"` style entries.
    pub fn parse(entry: &str) -> Result<Self, String> {
        let entry = entry.trim();
        match entry.split_once('/') {
            None => entry
                .parse()
                .map(IpRule::Exact)
                .map_err(|_| format!("Invalid allowed IP entry: {}", entry)),
            Some((addr, prefix)) => {
                let base: IpAddr = addr
                    .parse()
                    .map_err(|_| format!("Invalid allowed IP entry: {}", entry))?;
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| format!("Invalid prefix length in allowed IP entry: {}", entry))?;
                let max = if base.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(format!("Prefix length out of range in allowed IP entry: {}", entry));
                }
                Ok(IpRule::Network { base, prefix })
            }
        }
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        match *self {
            IpRule::Exact(ip) => ip == addr,
            IpRule::Network { base, prefix } => match (base, addr) {
                (IpAddr::V4(base), IpAddr::V4(addr)) => {
                    let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
                    u32::from(base) & mask == u32::from(addr) & mask
                }
                (IpAddr::V6(base), IpAddr::V6(addr)) => {
                    let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
                    u128::from(base) & mask == u128::from(addr) & mask
                }
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AuthState {
    failed_attempts: u32,
    last_failure: Option<Instant>,
    blocked_until: Option<Instant>,
}

impl AuthState {
    /// Failures below the threshold are forgotten after one cooldown period.
    fn is_stale(&self, now: Instant, cooldown: Duration) -> bool {
        match self.blocked_until {
            Some(until) => until <= now,
            None => self
                .last_failure
                .map_or(true, |at| now.saturating_duration_since(at) >= cooldown),
        }
    }
}

pub struct AuthGuard {
    enabled: bool,
    token: Option<String>,
    allowed: Vec<IpRule>,
    max_failed_attempts: u32,
    block_duration: Duration,
    per_request: bool,
    states: Mutex<HashMap<String, AuthState>>,
}

impl AuthGuard {
    /// Build from validated settings. Unparseable allow-list entries are
    /// skipped with a warning.
    pub fn new(settings: &SecuritySettings) -> Self {
        let allowed = settings
            .allowed_ips
            .iter()
            .filter_map(|entry| match IpRule::parse(entry) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            })
            .collect();

        Self {
            enabled: settings.auth_enabled,
            token: settings.auth_token.clone(),
            allowed,
            max_failed_attempts: settings.max_failed_attempts.max(1),
            block_duration: Duration::from_secs(settings.block_duration_secs),
            per_request: settings.per_request_auth,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Guard that accepts everything.
    pub fn disabled() -> Self {
        Self::new(&SecuritySettings {
            auth_enabled: false,
            ..SecuritySettings::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether every request must carry a token, rather than only `initialize`.
    pub fn per_request(&self) -> bool {
        self.enabled && self.per_request
    }

    pub fn authenticate(&self, session: &ClientSession, supplied: Option<&str>) -> Result<(), AuthError> {
        self.authenticate_at(&session.remote_address, supplied, Instant::now())
    }

    pub(crate) fn authenticate_at(
        &self,
        remote: &str,
        supplied: Option<&str>,
        now: Instant,
    ) -> Result<(), AuthError> {
        if !self.enabled {
            return Ok(());
        }

        let mut states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = states.entry(remote.to_string()).or_default();

        if let Some(until) = state.blocked_until {
            if until > now {
                let retry_after_secs = until.saturating_duration_since(now).as_secs().max(1);
                debug!(remote = %remote, "Rejected request from blocked address");
                return Err(AuthError::Blocked { retry_after_secs });
            }
            // Cooldown served: start counting from scratch
            info!(remote = %remote, "Address block expired");
            *state = AuthState::default();
        } else if state.is_stale(now, self.block_duration) {
            *state = AuthState::default();
        }

        let outcome = if !self.address_allowed(remote) {
            Err(AuthError::AddressNotAllowed)
        } else {
            match supplied {
                None | Some("") => Err(AuthError::MissingToken),
                Some(token) if self.token_matches(token) => Ok(()),
                Some(_) => Err(AuthError::InvalidToken),
            }
        };

        match outcome {
            Ok(()) => {
                state.failed_attempts = 0;
                Ok(())
            }
            Err(err) => {
                state.failed_attempts += 1;
                state.last_failure = Some(now);
                warn!(
                    remote = %remote,
                    failed_attempts = state.failed_attempts,
                    reason = %err,
                    "Authentication failed"
                );
                if state.failed_attempts >= self.max_failed_attempts {
                    state.blocked_until = Some(now + self.block_duration);
                    warn!(
                        remote = %remote,
                        cooldown_secs = self.block_duration.as_secs(),
                        "Address blocked due to repeated failed attempts"
                    );
                }
                Err(err)
            }
        }
    }

    pub fn is_blocked(&self, remote: &str) -> bool {
        let states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states
            .get(remote)
            .and_then(|s| s.blocked_until)
            .is_some_and(|until| until > Instant::now())
    }

    pub fn failed_attempts(&self, remote: &str) -> u32 {
        let states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.get(remote).map_or(0, |s| s.failed_attempts)
    }

    /// Drop bookkeeping for addresses with no active block and no failure
    /// within the last cooldown period.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub(crate) fn prune_at(&self, now: Instant) -> usize {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = states.len();
        states.retain(|_, s| !s.is_stale(now, self.block_duration));
        before - states.len()
    }

    fn address_allowed(&self, remote: &str) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        match remote.parse::<IpAddr>() {
            Ok(addr) => self.allowed.iter().any(|rule| rule.matches(addr)),
            Err(_) => false,
        }
    }

    fn token_matches(&self, supplied: &str) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return false;
        };
        // Hash both sides so the comparison runs over equal-length input
        let supplied = Sha256::digest(supplied.as_bytes());
        let expected = Sha256::digest(expected.as_bytes());
        supplied.as_slice().ct_eq(expected.as_slice()).into()
    }
}
