//! Error types for the DCA control plane

use thiserror::Error;

/// Result type alias for DCA operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the control plane
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Send or reply deadline exceeded
    #[error("request timed out: {0}")]
    RequestTimeout(String),

    /// No live connection for the target datakit
    #[error("datakit unavailable: {0}")]
    DeviceUnavailable(String),

    /// No handler registered for the action name
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Status state-machine violation
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Reply id/action/payload inconsistency
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Registration rejected: a live session already exists for the conn_id
    #[error("duplicate connection: {0}")]
    DuplicateConnection(String),

    /// Device record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Stable error code surfaced in the response envelope
    ///
    /// Internal detail stays in logs; callers only see this code plus a
    /// short message.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "server.config",
            Self::RequestTimeout(_) => "datakit.requestTimeout",
            Self::DeviceUnavailable(_) => "datakit.unavailable",
            Self::UnknownAction(_) => "datakit.unknownAction",
            Self::InvalidTransition { .. } => "datakit.invalidTransition",
            Self::ProtocolMismatch(_) => "datakit.protocolMismatch",
            Self::DuplicateConnection(_) => "datakit.duplicateConnection",
            Self::NotFound(_) => "datakit.notFound",
            Self::Io(_) => "server.io",
            Self::Serialization(_) => "server.serialization",
            Self::Database(_) | Self::Sqlite(_) => "server.database",
        }
    }

    /// HTTP status code the REST surface maps this error to
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::RequestTimeout(_) => 504,
            Self::DeviceUnavailable(_) | Self::NotFound(_) => 404,
            Self::UnknownAction(_) => 400,
            Self::InvalidTransition { .. } | Self::DuplicateConnection(_) => 409,
            _ => 500,
        }
    }
}
