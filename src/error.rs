//! Error types for redlimit.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for redlimit operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limit or window that is zero or too large was supplied
    #[error("Invalid window: limit={limit}, window_seconds={window_seconds}")]
    InvalidWindow { limit: u64, window_seconds: u64 },

    /// The atomic hit sequence could not be completed.
    ///
    /// Transport, script and reply failures all collapse into this kind; the
    /// underlying cause is kept as the error source.
    #[error("Could not register rate limit hit for {key}")]
    HitRegistrationFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Store errors outside of hit registration
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for redlimit operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
