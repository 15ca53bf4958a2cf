//! Error types for media-relay
//!
//! This module provides the error handling for the library:
//! - [`Error`], the crate-wide error returned by public operations
//! - [`DatabaseError`] for StateStore failures
//! - [`StageError`], the typed failure taxonomy a pipeline stage can produce
//!   (transient, permanent, integrity, storage)
//! - [`ErrorKind`], the persistable discriminant stored next to every recorded failure

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for media-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-relay
///
/// Stage failures are normally caught by the orchestrator and recorded against the
/// unit or file they belong to; they only surface through this type from direct
/// calls into the store, the ledger, or configuration loading.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "workers.enrich_workers")
        key: Option<String>,
    },

    /// StateStore operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A pipeline stage failed
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// A state change that would break the monotonic state machine
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        /// What was being updated ("unit" or "file")
        entity: &'static str,
        /// Stored state
        from: String,
        /// Requested state
        to: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unit or file not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not starting new work
    #[error("shutdown in progress: not starting new work")]
    ShuttingDown,

    /// A pipeline run is already in progress
    #[error("a pipeline run is already in progress")]
    AlreadyRunning,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// StateStore errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// A stored value could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Persistable classification of a stage failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network blips, rate limiting, timeouts
    Transient,
    /// Corrupt archive, unsupported file, permission denied
    Permanent,
    /// Path traversal, checksum or size mismatch
    Integrity,
    /// StateStore write failure
    Storage,
}

impl ErrorKind {
    /// Stable text stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Storage => "storage",
        }
    }

    /// Parse the stored text form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(ErrorKind::Transient),
            "permanent" => Some(ErrorKind::Permanent),
            "integrity" => Some(ErrorKind::Integrity),
            "storage" => Some(ErrorKind::Storage),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure produced by a single stage invocation
///
/// Transient failures are eligible for automatic backoff; everything else is
/// recorded against the unit or file and waits for the retry ledger.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// Temporary failure (network, rate limit, timeout)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Failure that will not go away by itself
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Integrity violation; the stage failed closed
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// The state store could not persist the outcome
    #[error("state store failure: {0}")]
    Storage(String),
}

impl StageError {
    /// Classification stored with the failure record
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Transient(_) => ErrorKind::Transient,
            StageError::Permanent(_) => ErrorKind::Permanent,
            StageError::Integrity(_) => ErrorKind::Integrity,
            StageError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// The bare message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            StageError::Transient(m)
            | StageError::Permanent(m)
            | StageError::Integrity(m)
            | StageError::Storage(m) => m,
        }
    }

    /// Rebuild a stage error from its persisted form
    pub fn from_parts(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Transient => StageError::Transient(message),
            ErrorKind::Permanent => StageError::Permanent(message),
            ErrorKind::Integrity => StageError::Integrity(message),
            ErrorKind::Storage => StageError::Storage(message),
        }
    }
}

impl From<Error> for StageError {
    fn from(error: Error) -> Self {
        match error {
            Error::Stage(e) => e,
            Error::Database(e) => StageError::Storage(e.to_string()),
            Error::Sqlx(e) => StageError::Storage(e.to_string()),
            Error::Io(e) => StageError::from(e),
            other => StageError::Permanent(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted => StageError::Transient(e.to_string()),
            _ => StageError::Permanent(e.to_string()),
        }
    }
}

impl Error {
    /// Machine-readable error code, used in events and summaries
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(e) => match e {
                DatabaseError::ConnectionFailed(_) => "database_connection_failed",
                DatabaseError::MigrationFailed(_) => "database_migration_failed",
                DatabaseError::QueryFailed(_) => "database_query_failed",
                DatabaseError::NotFound(_) => "record_not_found",
                DatabaseError::Corrupt(_) => "corrupt_record",
            },
            Error::Sqlx(_) => "database_error",
            Error::Stage(e) => match e.kind() {
                ErrorKind::Transient => "transient_error",
                ErrorKind::Permanent => "permanent_error",
                ErrorKind::Integrity => "integrity_error",
                ErrorKind::Storage => "storage_error",
            },
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::AlreadyRunning => "already_running",
            Error::Other(_) => "internal_error",
        }
    }

    /// Whether this error means the state store could not be trusted to have persisted a write
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Sqlx(_) | Error::Stage(StageError::Storage(_))
        )
    }
}
