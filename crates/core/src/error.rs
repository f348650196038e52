use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {}", .0.display())]
    Permission(PathBuf),

    #[error("a root folder is already registered for {}", .0.display())]
    DuplicatePath(PathBuf),

    #[error("unreadable media {}: {reason}", .path.display())]
    UnreadableMedia { path: PathBuf, reason: String },

    #[error("root folder does not exist or is not a directory: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("root folder is disabled: {0}")]
    RootDisabled(String),

    /// Never returned to callers; the store downgrades it to a cache miss.
    #[error("corrupt cache entry {key}: {reason}")]
    CacheCorrupt { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Handed to callers that waited on another caller's rescan.
    #[error("{0}")]
    Shared(Arc<Error>),
}

impl Error {
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => Error::Permission(path.to_path_buf()),
            _ => Error::Io(err),
        }
    }

    /// Looks through `Shared` so callers can match on the original kind.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root_cause(),
            other => other,
        }
    }
}
