//! Error types for fieldstation.
//!
//! This module defines all error types used throughout the fieldstation crate,
//! providing detailed context for debugging and user-friendly error messages.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for fieldstation operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Validation Errors ===
    /// A band label outside the accepted operating set.
    #[error("invalid band '{label}': must be one of {valid}")]
    InvalidBand {
        /// The rejected label.
        label: String,
        /// Comma-separated accepted labels.
        valid: String,
    },

    /// Malformed control-channel input.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    // === Storage Errors ===
    /// Failed to open or create the outbox database.
    #[error("failed to open outbox database at {path}: {source}")]
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

    // === Connectivity Errors ===
    /// A connectivity probe or collector request failed.
    #[error("connectivity error: {message}")]
    Connectivity {
        /// Description of the failure.
        message: String,
    },

    /// The remote collector rejected an upload batch.
    #[error("collector rejected upload: HTTP {status}")]
    UploadRejected {
        /// The HTTP status code returned by the collector.
        status: u16,
    },

    // === Source Errors ===
    /// An event source failed to start.
    #[error("failed to start source '{name}': {message}")]
    SourceStart {
        /// Name of the source.
        name: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    /// An event source failed to stop.
    #[error("failed to stop source '{name}': {message}")]
    SourceStop {
        /// Name of the source.
        name: &'static str,
        /// Description of what went wrong.
        message: String,
    },

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

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for fieldstation operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Connectivity {
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Create a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new connectivity error.
    #[must_use]
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a source start error.
    #[must_use]
    pub fn source_start(name: &'static str, message: impl Into<String>) -> Self {
        Self::SourceStart {
            name,
            message: message.into(),
        }
    }

    /// Create a source stop error.
    #[must_use]
    pub fn source_stop(name: &'static str, message: impl Into<String>) -> Self {
        Self::SourceStop {
            name,
            message: message.into(),
        }
    }

    /// Check if this error rejects caller input rather than reporting a fault.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::InvalidBand { .. })
    }

    /// Check if this error is a connectivity failure (retryable).
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. } | Self::UploadRejected { .. }
        )
    }
}
