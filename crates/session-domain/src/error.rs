use thiserror::Error;

/// Error kinds surfaced to callers of the session & branch store (spec §7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock timeout acquiring write lock for session {session_id}")]
    LockTimeout { session_id: String },

    #[error("lock subsystem unavailable: {0}")]
    LockUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Driver(#[from] rusqlite::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Short, stable error code for client-facing responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Conflict(_) => "CONFLICT",
            StoreError::LockTimeout { .. } => "LOCK_TIMEOUT",
            StoreError::LockUnavailable(_) => "LOCK_UNAVAILABLE",
            StoreError::Cancelled => "CANCELLED",
            StoreError::Driver(_) => "DRIVER_ERROR",
            StoreError::Parse(_) => "PARSE_ERROR",
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
            StoreError::Io(_) => "IO_ERROR",
            StoreError::Config(_) => "CONFIG_ERROR",
            StoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
