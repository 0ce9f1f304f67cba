//! Configuration system for DBWS-MCP
//!
//! Provides a 3-tier configuration hierarchy:
//! 1. Environment variables (highest priority)
//! 2. TOML config file (medium priority)
//! 3. Built-in defaults (lowest priority)

pub mod defaults;
mod loader;
mod settings;

pub use loader::{ConfigError, ConfigLoader};
pub use settings::{
    DatabaseServiceSettings, FilesystemSettings, LimitSettings, LogFormat, LoggingSettings,
    RateLimitSettings, SecuritySettings, ServerConfig, ServerSettings,
};
