//! # Domain Types
//!
//! Core data types shared by the session manager, the device session and
//! the orchestrator.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Domain Types                                   │
//! │                                                                         │
//! │  ┌──────────────┐    ┌────────────────┐    ┌────────────────────────┐  │
//! │  │ Credentials  │    │ DeviceIdentity │    │ TokenState             │  │
//! │  │ ──────────── │    │ ────────────── │    │ ──────────────────     │  │
//! │  │ email        │    │ device_id      │    │ access_token           │  │
//! │  │ password     │    │ (generated     │    │ refresh_token          │  │
//! │  │ (immutable)  │    │  once, kept)   │    │ expires_at (ABSOLUTE)  │  │
//! │  └──────────────┘    └────────────────┘    └────────────────────────┘  │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │ DeviceSnapshot                                                    │ │
//! │  │ frame_status / image_status / version_check  (cloud, persisted)   │ │
//! │  │ last_local_status                            (local, never stored)│ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::status::DeviceStatusFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Tokens are refreshed this long before their absolute expiry.
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 60 * 60;

// =============================================================================
// Credentials & Identity
// =============================================================================

/// Account credentials. Immutable for the life of a device link.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Stable random identifier sent with every auth call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Token State
// =============================================================================

/// Access/refresh token pair.
///
/// `expires_at` is an absolute unix timestamp in seconds. It is never a
/// duration, even though the auth response calls the field `expiresIn`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
}

impl TokenState {
    /// `now >= expires_at - buffer`
    pub fn is_expiring_soon(&self, now_unix: i64, buffer_secs: i64) -> bool {
        now_unix >= self.expires_at.saturating_sub(buffer_secs)
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at
    }

    pub fn remaining_secs(&self, now_unix: i64) -> i64 {
        (self.expires_at - now_unix).max(0)
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What the session manager persists for one device link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub device_id: Option<DeviceIdentity>,
    #[serde(default)]
    pub token: Option<TokenState>,
}

impl SessionRecord {
    pub const SCHEMA_VERSION: u32 = 1;
}

// =============================================================================
// Device Snapshot
// =============================================================================

/// The externally visible state of one frame.
///
/// Cloud fields are replaced together on every successful cloud poll. The
/// local status is attached separately and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(default)]
    pub frame_status: Map<String, Value>,
    #[serde(default)]
    pub image_status: Map<String, Value>,
    #[serde(default)]
    pub version_check: Map<String, Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_local_status: Option<DeviceStatusFrame>,
}

impl DeviceSnapshot {
    pub const SCHEMA_VERSION: u32 = 1;

    /// A snapshot built from one successful cloud tick.
    pub fn from_cloud(
        frame_status: Map<String, Value>,
        image_status: Map<String, Value>,
        version_check: Map<String, Value>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            frame_status,
            image_status,
            version_check,
            updated_at: Some(updated_at),
            last_local_status: None,
        }
    }

    /// Same cloud fields, new local status.
    pub fn with_local_status(&self, status: DeviceStatusFrame) -> Self {
        Self {
            last_local_status: Some(status),
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updated_at.is_none() && self.last_local_status.is_none()
    }

    /// Battery level: local read wins, cloud `batteryCapacity` otherwise.
    pub fn battery_capacity(&self) -> Option<u64> {
        self.last_local_status
            .as_ref()
            .map(|s| u64::from(s.capacity))
            .or_else(|| self.frame_status.get("batteryCapacity").and_then(Value::as_u64))
    }
}

/// Pick this frame's entry out of a cloud list of `{uuid: {...}}` maps.
///
/// The first list item containing `frame_uuid` wins. A missing key, or a
/// payload that is not a list of objects, yields an empty map.
pub fn extract_frame_entry(payload: &Value, frame_uuid: &str) -> Map<String, Value> {
    payload
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .find_map(|item| item.get(frame_uuid))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

// =============================================================================
// Conversion Report
// =============================================================================

/// Outcome of an upload-then-poll conversion job.
///
/// A timeout is not an error: `timed_out` is set and `response` holds the
/// last observed poll response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionReport {
    pub response: Value,
    pub polls: u32,
    pub timed_out: bool,
}

impl ConversionReport {
    pub fn status(&self) -> Option<&str> {
        self.response.get("status").and_then(Value::as_str)
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Some("pending")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token(expires_at: i64) -> TokenState {
        TokenState {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at,
        }
    }

    #[test]
    fn test_token_expiring_within_buffer() {
        let now = 1_700_000_000;
        // 30 minutes left, one hour buffer
        let t = token(now + 30 * 60);
        assert!(t.is_expiring_soon(now, DEFAULT_REFRESH_BUFFER_SECS));
        assert!(!t.is_expired(now));
        assert_eq!(t.remaining_secs(now), 1800);
    }

    #[test]
    fn test_token_valid_outside_buffer() {
        let now = 1_700_000_000;
        let t = token(now + 2 * 3600);
        assert!(!t.is_expiring_soon(now, DEFAULT_REFRESH_BUFFER_SECS));
        assert!(t.is_expiring_soon(now + 3600, DEFAULT_REFRESH_BUFFER_SECS));
    }

    #[test]
    fn test_expired_token() {
        let t = token(100);
        assert!(t.is_expired(100));
        assert_eq!(t.remaining_secs(500), 0);
    }

    #[test]
    fn test_secrets_not_in_debug() {
        let creds = Credentials::new("me@example.com", "s3cret");
        assert!(!format!("{:?}", creds).contains("s3cret"));
        let t = TokenState {
            access_token: "tok-abc".into(),
            refresh_token: "ref-xyz".into(),
            expires_at: 1,
        };
        let debug = format!("{:?}", t);
        assert!(!debug.contains("tok-abc"));
        assert!(!debug.contains("ref-xyz"));
    }

    #[test]
    fn test_extract_frame_entry() {
        let payload = json!([{"frameA": {"batteryCapacity": 87}}]);
        let entry = extract_frame_entry(&payload, "frameA");
        assert_eq!(entry.get("batteryCapacity"), Some(&json!(87)));
        assert!(extract_frame_entry(&payload, "frameB").is_empty());
    }

    #[test]
    fn test_extract_first_match_wins() {
        let payload = json!([
            {"other": {"x": 1}},
            {"frameA": {"x": 2}},
            {"frameA": {"x": 3}}
        ]);
        assert_eq!(extract_frame_entry(&payload, "frameA").get("x"), Some(&json!(2)));
    }

    #[test]
    fn test_extract_tolerates_odd_payloads() {
        assert!(extract_frame_entry(&json!({"frameA": {}}), "frameA").is_empty());
        assert!(extract_frame_entry(&json!(null), "frameA").is_empty());
        assert!(extract_frame_entry(&json!([1, "x", {"frameA": 5}]), "frameA").is_empty());
    }

    #[test]
    fn test_snapshot_local_status_not_serialized() {
        let frame = DeviceStatusFrame::decode(&[0u8; 28]).unwrap();
        let snapshot = DeviceSnapshot::default().with_local_status(frame);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("last_local_status").is_none());
        let restored: DeviceSnapshot = serde_json::from_value(json).unwrap();
        assert!(restored.last_local_status.is_none());
    }

    #[test]
    fn test_battery_prefers_local_status() {
        let mut frame_status = Map::new();
        frame_status.insert("batteryCapacity".into(), json!(40));
        let snapshot = DeviceSnapshot::from_cloud(frame_status, Map::new(), Map::new(), Utc::now());
        assert_eq!(snapshot.battery_capacity(), Some(40));

        let mut raw = [0u8; 28];
        raw[5] = 91;
        let local = DeviceStatusFrame::decode(&raw).unwrap();
        assert_eq!(snapshot.with_local_status(local).battery_capacity(), Some(91));
    }

    #[test]
    fn test_conversion_report_status() {
        let report = ConversionReport {
            response: json!({"status": "pending"}),
            polls: 60,
            timed_out: true,
        };
        assert!(report.is_pending());
        assert_eq!(report.status(), Some("pending"));
    }

    #[test]
    fn test_device_identity_generated_once() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }
}
