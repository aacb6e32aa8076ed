//! # Sync Error Types
//!
//! Error types for cloud, local-link and orchestration operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────┐  ┌─────────────────────┐ │
//! │  │  Configuration  │  │   Cloud             │  │   Local link        │ │
//! │  │                 │  │                     │  │                     │ │
//! │  │  InvalidConfig  │  │  AuthenticationFail │  │  LinkUnavailable    │ │
//! │  │  InvalidUrl     │  │  RequestFailed      │  │  DeviceNotReady     │ │
//! │  │  ConfigLoad/Save│  │  Network / Timeout  │  │  LinkFailed         │ │
//! │  └─────────────────┘  └─────────────────────┘  └─────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────┐                          │
//! │  │  Codec          │  │   Storage           │                          │
//! │  │                 │  │                     │                          │
//! │  │  Core(Malformed │  │  Store              │                          │
//! │  │  Frame, ...)    │  │  Serialization      │                          │
//! │  │  InvalidImage   │  │                     │                          │
//! │  └─────────────────┘  └─────────────────────┘                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A conversion that never leaves `pending` is not an error: it is reported
//! through [`inkposter_core::ConversionReport::timed_out`].

use inkposter_core::CoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Cloud Errors
    // =========================================================================
    /// Login and refresh both failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Non-2xx response after the single 401 retry.
    #[error("{method} {path} failed with HTTP {status}")]
    RequestFailed {
        method: String,
        path: String,
        status: u16,
    },

    /// Transport-level HTTP failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Response body was not what the endpoint promises.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // Local Link Errors
    // =========================================================================
    /// The device cannot be resolved or connected, or no local link exists.
    #[error("Local link unavailable: {0}")]
    LinkUnavailable(String),

    /// Device kept reporting launcherCmdReady=false after one retry cycle.
    #[error("Device not ready for commands (launcherCmdReady=false)")]
    DeviceNotReady,

    /// A characteristic read or write failed mid-session.
    #[error("Local link operation failed: {0}")]
    LinkFailed(String),

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// Image payload could not be fetched or decoded.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Status codec or command framer failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Persisted state could not be read or written.
    #[error("State store error: {0}")]
    Store(String),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<inkposter_db::DbError> for SyncError {
    fn from(err: inkposter_db::DbError) -> Self {
        SyncError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if a later tick or user retry may succeed.
    ///
    /// Nothing in this crate retries automatically beyond the single
    /// readiness retry and the single 401 retry; loops use this only to
    /// classify what they report.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_)
            | SyncError::Timeout(_)
            | SyncError::LinkUnavailable(_)
            | SyncError::LinkFailed(_)
            | SyncError::DeviceNotReady => true,
            SyncError::RequestFailed { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the failure came from the local link.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            SyncError::LinkUnavailable(_) | SyncError::LinkFailed(_) | SyncError::DeviceNotReady
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::DeviceNotReady.is_retryable());
        assert!(SyncError::RequestFailed {
            method: "GET".into(),
            path: "/frame/status".into(),
            status: 503
        }
        .is_retryable());

        assert!(!SyncError::RequestFailed {
            method: "GET".into(),
            path: "/frame/status".into(),
            status: 404
        }
        .is_retryable());
        assert!(!SyncError::AuthenticationFailed("bad password".into()).is_retryable());
        assert!(!SyncError::InvalidConfig("x".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::RequestFailed {
            method: "POST".into(),
            path: "/item/convert".into(),
            status: 413,
        };
        assert_eq!(err.to_string(), "POST /item/convert failed with HTTP 413");
    }

    #[test]
    fn test_core_errors_wrap_transparently() {
        let err: SyncError = CoreError::MalformedFrame {
            expected: 28,
            actual: 4,
        }
        .into();
        assert!(err.to_string().contains("expected at least 28"));
        assert!(!err.is_link_error());
    }
}
