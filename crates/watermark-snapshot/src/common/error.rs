//! Error types for watermark-windowed snapshots
//!
//! Every failure the coordinator can surface is a [`SnapshotError`].
//! Includes error classification for retry decisions and alerting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Data store errors (range query, executed position lookup)
    Store,
    /// Malformed replication positions
    Position,
    /// Control channel errors
    Signal,
    /// Configuration errors (invalid settings, unsupported server)
    Configuration,
    /// Serialization errors (JSON, persisted context)
    Serialization,
    /// Cooperative cancellation
    Cancellation,
    /// Other/unknown errors
    Other,
}

/// Snapshot errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Range query or executed position lookup failed
    #[error("Data access error: {0}")]
    DataAccess(String),

    /// The store cannot report executed position sets
    #[error("Server version {actual} does not expose executed position sets (requires {required} or later)")]
    UnsupportedVersion { required: String, actual: String },

    /// Malformed position or position set text
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// Malformed control channel command
    #[error("Signal error: {0}")]
    Signal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Flush or chunk read interrupted
    #[error("Snapshot interrupted")]
    Interrupted,

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SnapshotError {
    /// Create a new data access error
    pub fn data_access(msg: impl Into<String>) -> Self {
        Self::DataAccess(msg.into())
    }

    /// Create an unsupported version error
    pub fn unsupported_version(required: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::UnsupportedVersion {
            required: required.into(),
            actual: actual.into(),
        }
    }

    /// Create a new invalid position error
    pub fn invalid_position(msg: impl Into<String>) -> Self {
        Self::InvalidPosition(msg.into())
    }

    /// Create a new signal error
    pub fn signal(msg: impl Into<String>) -> Self {
        Self::Signal(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// A failed snapshot run is never retried in place; only the transport
    /// level errors below may succeed when the run is restarted from
    /// persisted state.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::DataAccess(msg) => {
                msg.contains("Lost connection")
                    || msg.contains("Deadlock")
                    || msg.contains("Lock wait timeout")
            }

            Self::UnsupportedVersion { .. }
            | Self::InvalidPosition(_)
            | Self::Signal(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::Interrupted
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Check if this error is a cooperative cancellation.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DataAccess(_) => ErrorCategory::Store,
            Self::UnsupportedVersion { .. } => ErrorCategory::Configuration,
            Self::InvalidPosition(_) => ErrorCategory::Position,
            Self::Signal(_) => ErrorCategory::Signal,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Store,
            Self::Interrupted => ErrorCategory::Cancellation,
            Self::InvalidState(_) => ErrorCategory::Other,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DataAccess(_) => "data_access_error",
            Self::UnsupportedVersion { .. } => "unsupported_version",
            Self::InvalidPosition(_) => "invalid_position",
            Self::Signal(_) => "signal_error",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Interrupted => "interrupted",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;
