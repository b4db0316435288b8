//! Error types for Recall Core
//!
//! All fallible operations return [`Result`], whose error side is [`MemoryError`].
//! Driver errors from `rusqlite`, `postgres` and `r2d2` are classified into the
//! variants below so callers can tell programming bugs (integrity violations)
//! apart from transient failures (unavailable backend, timeouts).

use thiserror::Error;

/// Result type alias for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Main error type for memory operations
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Missing or invalid configuration, unknown backend or tokenizer type
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection or driver failure
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Driver or pool timeout
    #[error("Backend timeout: {0}")]
    Timeout(String),

    /// Duplicate sequence, foreign-key violation, conflicting compaction
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Unknown message or summary id
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (`message`, `summary`, ...)
        kind: &'static str,
        /// Requested id
        id: i64,
    },

    /// The summarizer callback failed; no state was written
    #[error("Summarizer failed: {0}")]
    Summarizer(String),

    /// Any other storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether a retry by the host could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::ConstraintViolation => Self::IntegrityViolation(e.to_string()),
                // Busy is reported once `busy_timeout` has run out
                ErrorCode::DatabaseBusy => Self::Timeout(e.to_string()),
                // Locked is immediate lock contention, no wait happened
                ErrorCode::DatabaseLocked => Self::BackendUnavailable(e.to_string()),
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied
                | ErrorCode::SystemIoFailure => Self::BackendUnavailable(e.to_string()),
                _ => Self::Storage(e.to_string()),
            },
            _ => Self::Storage(e.to_string()),
        }
    }
}

impl From<postgres::Error> for MemoryError {
    fn from(e: postgres::Error) -> Self {
        use postgres::error::SqlState;

        if e.is_closed() {
            return Self::BackendUnavailable(e.to_string());
        }
        match e.code() {
            Some(code)
                if *code == SqlState::UNIQUE_VIOLATION
                    || *code == SqlState::FOREIGN_KEY_VIOLATION
                    || *code == SqlState::NOT_NULL_VIOLATION
                    || *code == SqlState::INTEGRITY_CONSTRAINT_VIOLATION =>
            {
                Self::IntegrityViolation(e.to_string())
            }
            Some(code) if *code == SqlState::QUERY_CANCELED => Self::Timeout(e.to_string()),
            Some(code)
                if *code == SqlState::CONNECTION_EXCEPTION
                    || *code == SqlState::CONNECTION_FAILURE
                    || *code == SqlState::ADMIN_SHUTDOWN =>
            {
                Self::BackendUnavailable(e.to_string())
            }
            Some(_) => Self::Storage(e.to_string()),
            // No SQLSTATE means the failure happened below the protocol (socket, TLS)
            None => Self::BackendUnavailable(e.to_string()),
        }
    }
}

impl From<r2d2::Error> for MemoryError {
    fn from(e: r2d2::Error) -> Self {
        // r2d2 only reports a checkout that ran past the pool's connection timeout
        Self::Timeout(e.to_string())
    }
}
