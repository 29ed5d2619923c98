//! Error types for trailbeacon.
//!
//! The crate-level [`Error`] covers storage, configuration and I/O failures.
//! Each pipeline component also has its own error type (acquisition, transmit,
//! notify) so callers can react to the exact failure without string matching.
//! Only [`NotifyError`] crosses into [`Error`], through the manual alert.

use std::path::PathBuf;
use thiserror::Error;

use crate::notify::NotifyError;

/// The main error type for trailbeacon operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// The backing store has no space left for another queue entry.
    #[error("storage is full: {0}")]
    StorageFull(String),

    /// Another thread panicked while holding the storage lock.
    #[error("storage lock poisoned")]
    StoragePoisoned,

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    /// An emergency contact was rejected.
    #[error("invalid emergency contact: {message}")]
    InvalidContact {
        /// Why the contact was rejected.
        message: String,
    },

    // === Pipeline Errors ===
    /// The fallback notification could not be sent.
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// There is no known location to report yet.
    #[error("no location has been recorded yet")]
    NoKnownLocation,

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for trailbeacon operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a configuration validation error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create an invalid contact error.
    #[must_use]
    pub fn invalid_contact(message: impl Into<String>) -> Self {
        Self::InvalidContact {
            message: message.into(),
        }
    }

    /// Map a `SQLite` error, surfacing `SQLITE_FULL` as [`Error::StorageFull`].
    #[must_use]
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => Self::StorageFull(err.to_string()),
            _ => Self::DatabaseQuery(err),
        }
    }

    /// Check if this error means the store ran out of space.
    #[must_use]
    pub fn is_storage_full(&self) -> bool {
        matches!(self, Self::StorageFull(_))
    }
}
