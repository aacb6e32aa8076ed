//! # Error Types
//!
//! Domain-specific error types for inkposter-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  inkposter-core errors (this file)                                     │
//! │  └── CoreError        - Codec / framer failures                        │
//! │                                                                         │
//! │  inkposter-db errors (separate crate)                                  │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  inkposter-sync errors (separate crate)                                │
//! │  └── SyncError        - Cloud, local link and orchestration failures   │
//! │                                                                         │
//! │  Flow: CoreError → SyncError → caller                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Codec and framer errors are always fatal to the operation that raised
//! them. The one lookup that never errors is the model table: an unknown
//! model string resolves to `None`.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core protocol errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Status payload shorter than the fixed frame length.
    ///
    /// ## When This Occurs
    /// - The transport returned a truncated characteristic value
    /// - The device runs firmware with an older, shorter status layout
    #[error("Malformed status frame: expected at least {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    /// Shared key is not valid hex.
    #[error("Invalid shared key: {0}")]
    InvalidSharedKey(String),

    /// The HMAC implementation rejected a key.
    #[error("HMAC key rejected: {0}")]
    MacKey(String),

    /// A framed command does not fit in one write.
    #[error("Command frame of {size} bytes exceeds the {max}-byte MTU")]
    CommandTooLarge { size: usize, max: usize },

    /// Command payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
