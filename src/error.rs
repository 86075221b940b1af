//! # Error Types
//!
//! Custom error types for Motion Uplink using `thiserror`.

use thiserror::Error;

/// Main error type for Motion Uplink
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors (identity file, journal)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Device identity storage could not be read or written
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// `start()` called while a session is already tracking
    #[error("Session {0} is already tracking")]
    AlreadyTracking(String),

    /// Upload failures surfaced outside the owner loop
    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Failure of a single batch delivery attempt.
///
/// Both variants are recoverable: the batch is requeued and retried on the
/// next flush trigger.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// Transport failure, timeout, or an unreadable success response
    #[error("Upload network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-success status
    #[error("Upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Result type alias for Motion Uplink
pub type Result<T> = std::result::Result<T, UplinkError>;
