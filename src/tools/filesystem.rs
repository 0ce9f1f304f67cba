//! Read-only filesystem tools confined to a root directory

use crate::mcp::protocol::ToolsCallResult;
use crate::registry::{
    handler_fn, InputSchema, PropertyType, ToolDescriptor, ToolError, ToolProvider, ToolResult,
};
use crate::tools::{optional_bool, optional_str, optional_u64, required_str};
use crate::utils::{ConfinedRoot, PathError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::Metadata;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, PartialEq)]
struct FileEntry {
    name: String,
    kind: &'static str,
    size: u64,
    permissions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified: Option<String>,
}

pub struct FilesystemTools {
    root: Arc<ConfinedRoot>,
    max_file_size: u64,
}

impl FilesystemTools {
    pub fn new(root: ConfinedRoot, max_file_size: u64) -> Self {
        Self {
            root: Arc::new(root),
            max_file_size,
        }
    }
}

impl ToolProvider for FilesystemTools {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        let root = self.root.clone();
        let list_tool = ToolDescriptor::new(
            "list_files",
            "List files and directories under the server root",
            InputSchema::empty()
                .property_with_default("path", PropertyType::String, "Directory to list", json!("."))
                .property_with_default(
                    "include_hidden",
                    PropertyType::Boolean,
                    "Include entries starting with '.'",
                    json!(false),
                ),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move { list_files(&root, &args).await }
            }),
        );

        let (root, max_file_size) = (self.root.clone(), self.max_file_size);
        let read_tool = ToolDescriptor::new(
            "read_file",
            "Read a UTF-8 text file under the server root",
            InputSchema::empty()
                .required("path", PropertyType::String, "File to read")
                .property("max_size", PropertyType::Integer, "Maximum bytes to read"),
            handler_fn(move |args, _ctx| {
                let root = root.clone();
                async move { read_file(&root, &args, max_file_size).await }
            }),
        );

        vec![list_tool, read_tool]
    }
}

fn path_error(err: PathError) -> ToolError {
    ToolError::Filesystem(err.to_string())
}

fn io_error(path: &str, err: std::io::Error) -> ToolError {
    ToolError::Filesystem(format!("cannot access '{}': {}", path, err))
}

async fn list_files(root: &ConfinedRoot, args: &Value) -> ToolResult {
    let requested = optional_str(args, "path").unwrap_or(".");
    let include_hidden = optional_bool(args, "include_hidden");
    let dir = root.resolve(requested).await.map_err(path_error)?;

    let metadata = tokio::fs::metadata(&dir).await.map_err(|e| io_error(requested, e))?;
    if !metadata.is_dir() {
        return Err(ToolError::Filesystem(format!("'{}' is not a directory", requested)));
    }

    let mut reader = tokio::fs::read_dir(&dir).await.map_err(|e| io_error(requested, e))?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(|e| io_error(requested, e))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !include_hidden && name.starts_with('.') {
            continue;
        }
        // Entries that vanish mid-listing are skipped.
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        entries.push(describe(name, &metadata));
    }

    entries.sort_by(|a, b| {
        (a.kind != "directory")
            .cmp(&(b.kind != "directory"))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    let listing = json!({
        "path": root.display(&dir),
        "count": entries.len(),
        "entries": entries,
    });
    ToolsCallResult::json(&listing).map_err(|e| ToolError::Internal(format!("failed to render result: {}", e)))
}

async fn read_file(root: &ConfinedRoot, args: &Value, max_file_size: u64) -> ToolResult {
    let requested = required_str(args, "path")?;
    let limit = optional_u64(args, "max_size")?
        .map(|n| n.min(max_file_size))
        .unwrap_or(max_file_size);
    let path = root.resolve(requested).await.map_err(path_error)?;

    let metadata = tokio::fs::metadata(&path).await.map_err(|e| io_error(requested, e))?;
    if metadata.is_dir() {
        return Err(ToolError::Filesystem(format!("'{}' is a directory", requested)));
    }
    if metadata.len() > limit {
        return Err(ToolError::Filesystem(format!(
            "'{}' is {} bytes, larger than the {} byte limit",
            requested,
            metadata.len(),
            limit
        )));
    }

    let bytes = tokio::fs::read(&path).await.map_err(|e| io_error(requested, e))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| ToolError::Filesystem(format!("'{}' is not valid UTF-8 text", requested)))?;
    Ok(ToolsCallResult::text(text))
}

fn describe(name: String, metadata: &Metadata) -> FileEntry {
    let kind = if metadata.is_dir() {
        "directory"
    } else if metadata.is_symlink() {
        "symlink"
    } else {
        "file"
    };

    FileEntry {
        name,
        kind,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        permissions: permissions(metadata),
        modified: metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true)),
    }
}

#[cfg(unix)]
fn permissions(metadata: &Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode();
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(not(unix))]
fn permissions(metadata: &Metadata) -> String {
    if metadata.permissions().readonly() {
        "r--".to_string()
    } else {
        "rw-".to_string()
    }
}
