//! DBWS-MCP - Model Context Protocol server for the database web service
//!
//! Serves newline-delimited JSON-RPC to MCP clients over TCP or stdio and
//! exposes three tool groups: server introspection, pass-through calls to
//! the database REST service, and read-only access to a confined directory.
//! Every call goes through authentication, per-client rate limiting and
//! input validation before it reaches a handler.

pub mod backend;
pub mod config;
pub mod mcp;
pub mod metrics;
pub mod registry;
pub mod security;
pub mod session;
pub mod tools;
pub mod types;
pub mod utils;

pub use config::{ConfigLoader, ServerConfig};
pub use mcp::{Dispatcher, McpServer};
pub use registry::{ToolDescriptor, ToolProvider, ToolRegistry};
pub use types::McpError;

use anyhow::{Context, Result};
use backend::DatabaseClient;
use metrics::MetricsCollector;
use security::{AuthGuard, RateLimiter};
use session::SessionStore;
use std::sync::Arc;
use tools::{AdminTools, DatabaseTools, FilesystemTools};
use tracing::info;
use utils::ConfinedRoot;

/// Wire every service described by `config` into a dispatcher with the
/// admin, database and filesystem tools registered.
pub fn build_dispatcher(config: &ServerConfig) -> Result<Dispatcher> {
    let sessions = Arc::new(SessionStore::new());
    let metrics = Arc::new(MetricsCollector::new());

    let client = DatabaseClient::new(&config.database_service).context("Invalid database service settings")?;
    let root_path = match &config.filesystem.root {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("Failed to determine working directory")?,
    };
    let root = ConfinedRoot::new(&root_path)
        .with_context(|| format!("Filesystem root {} is not accessible", root_path.display()))?;
    info!(root = %root.root().display(), service = %client.base_url(), "Tool backends configured");

    let admin = AdminTools::new(metrics.clone(), sessions.clone());
    let database = DatabaseTools::new(client);
    let filesystem = FilesystemTools::new(root, config.limits.max_file_size);
    let registry = tools::build_registry(&[&admin, &database, &filesystem])?;

    let auth = if config.security.auth_enabled {
        AuthGuard::new(&config.security)
    } else {
        AuthGuard::disabled()
    };
    let limiter = RateLimiter::new(config.rate_limiting.requests_per_window, config.rate_limit_window());

    Ok(Dispatcher::new(
        Arc::new(registry),
        sessions,
        Arc::new(auth),
        Arc::new(limiter),
        metrics,
    ))
}

/// Validate `config` and build a ready-to-run server from it.
pub fn build_server(config: ServerConfig) -> Result<McpServer> {
    config.validate()?;
    let dispatcher = build_dispatcher(&config)?;
    Ok(McpServer::new(config, Arc::new(dispatcher)))
}
