//! Path confinement for the filesystem tools
//!
//! Every requested path is resolved against a fixed root. Lexical `..`
//! escapes are caught before touching the disk; symlinks are caught by
//! canonicalizing the result and checking it is still under the root.

use path_clean::PathClean;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path '{0}' is outside the allowed directory")]
    OutsideRoot(String),

    #[error("path '{0}' does not exist")]
    NotFound(String),

    #[error("cannot access '{path}': {reason}")]
    Io { path: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ConfinedRoot {
    root: PathBuf,
}

impl ConfinedRoot {
    /// The root must exist; it is canonicalized once here.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` (relative to the root, or absolute) to an
    /// existing path inside the root.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, PathError> {
        let requested_path = Path::new(requested);
        let joined = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            self.root.join(requested_path)
        };

        let cleaned = joined.clean();
        if !cleaned.starts_with(&self.root) {
            return Err(PathError::OutsideRoot(requested.to_string()));
        }

        let canonical = match tokio::fs::canonicalize(&cleaned).await {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PathError::NotFound(requested.to_string()))
            }
            Err(e) => {
                return Err(PathError::Io {
                    path: requested.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        if !canonical.starts_with(&self.root) {
            return Err(PathError::OutsideRoot(requested.to_string()));
        }
        Ok(canonical)
    }

    /// Display form relative to the root (`.` for the root itself).
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}
