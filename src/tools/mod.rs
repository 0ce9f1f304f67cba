//! Tool providers
//!
//! Each provider contributes a group of tools to the registry at startup.

pub mod admin;
pub mod database;
pub mod filesystem;

pub use admin::AdminTools;
pub use database::DatabaseTools;
pub use filesystem::FilesystemTools;

use crate::registry::{RegistryError, ToolError, ToolProvider, ToolRegistry};
use serde_json::Value;
use tracing::info;

/// Build a registry from `providers`, in order.
pub fn build_registry(providers: &[&dyn ToolProvider]) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    for provider in providers {
        registry.register_provider(*provider)?;
    }
    info!(tools = registry.len(), "Tool registry ready");
    Ok(registry)
}

// Argument accessors. Types were already checked against the schema, so a
// mismatch here means the schema and handler disagree.

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{}' must be a string", key)))
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub(crate) fn optional_u64(args: &Value, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ToolError::InvalidArguments(format!("'{}' must be a non-negative integer", key))),
    }
}

pub(crate) fn optional_bool(args: &Value, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}
