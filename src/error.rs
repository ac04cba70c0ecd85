//! Error kinds surfaced by the storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Missing project, session or file
    #[error("{0}")]
    NotFound(String),

    /// Malformed entry; callers log and skip
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation refused for this backing store (e.g. database-backed sessions)
    #[error("{0}")]
    UnsupportedOperation(String),

    /// Remote command or file access failed
    #[error("remote transport error: {0}")]
    RemoteTransport(String),

    /// Expected database table is absent
    #[error("schema mismatch: missing table {0}")]
    SchemaMismatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StorageError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
