//! Built-in defaults
//!
//! Lowest-precedence configuration layer. Values match what a fresh
//! deployment of the database MCP server expects out of the box.

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
pub const DEFAULT_BLOCK_DURATION_SECS: u64 = 300;

pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 100;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// 1 MiB, for both single files and single protocol messages.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1_048_576;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_048_576;

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_DATABASE_SERVICE_URL: &str = "http://localhost:8000";
pub const DEFAULT_DATABASE_SERVICE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DATABASE_SERVICE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_DATABASE_SERVICE_RETRY_BACKOFF_MS: u64 = 200;

/// Config file name looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = "dbws-mcp.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "DBWS_MCP_CONFIG";
