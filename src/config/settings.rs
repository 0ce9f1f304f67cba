//! Configuration file types
//!
//! Every section is `#[serde(default)]`, so a config file only needs to
//! name the values it overrides.

use crate::config::defaults::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub security: SecuritySettings,
    pub rate_limiting: RateLimitSettings,
    pub limits: LimitSettings,
    pub logging: LoggingSettings,
    pub database_service: DatabaseServiceSettings,
    pub filesystem: FilesystemSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Serve a single client over stdin/stdout instead of listening on TCP.
    pub stdio: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            stdio: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecuritySettings {
    pub auth_enabled: bool,
    pub auth_token: Option<String>,
    /// Exact addresses or CIDR blocks. Empty means every address is allowed.
    pub allowed_ips: Vec<String>,
    pub max_failed_attempts: u32,
    pub block_duration_secs: u64,
    /// Check the token on every request instead of once at `initialize`.
    pub per_request_auth: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            auth_enabled: true,
            auth_token: None,
            allowed_ips: Vec::new(),
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            block_duration_secs: DEFAULT_BLOCK_DURATION_SECS,
            per_request_auth: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_window: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: DEFAULT_RATE_LIMIT_REQUESTS,
            window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitSettings {
    pub max_file_size: u64,
    pub max_message_bytes: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseServiceSettings {
    pub url: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DatabaseServiceSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_SERVICE_URL.to_string(),
            timeout_secs: DEFAULT_DATABASE_SERVICE_TIMEOUT_SECS,
            retry_attempts: DEFAULT_DATABASE_SERVICE_RETRY_ATTEMPTS,
            retry_backoff_ms: DEFAULT_DATABASE_SERVICE_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesystemSettings {
    /// Root every filesystem tool path is confined to. Defaults to the
    /// working directory at startup.
    pub root: Option<PathBuf>,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limiting.window_seconds)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.security.block_duration_secs)
    }

    /// Copy safe to print or log: the auth token is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.security.auth_token.is_some() {
            copy.security.auth_token = Some("********".to_string());
        }
        copy
    }
}
