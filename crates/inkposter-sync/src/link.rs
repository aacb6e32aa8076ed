//! # Local Link Transport
//!
//! The seam between the device session and a real radio stack.
//!
//! ```text
//!   DeviceSession ──► LinkTransport::connect ──► LinkConnection
//!                                                  ├─ read_status   (status char)
//!                                                  ├─ write_command (command char)
//!                                                  └─ disconnect
//!
//!   radio events ──► PresenceEvent ──► mpsc ──► SyncAgent presence loop
//! ```
//!
//! The transport owns physical-layer retries. Everything above it retries
//! at most once, and only where the device session says so.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::SyncResult;

/// Advertised name prefix of Inkposter frames.
pub const DEVICE_NAME_PREFIX: &str = "InkP-";

/// Primary GATT service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x706218ee_d3d6_46ad_8080_6eefbacf7dbc);

/// Readable 28-byte status characteristic.
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0xaa5a52bb_e560_42b5_be83_7b79f7627f6d);

/// Writable command characteristic.
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x1b5f2d1a_8ff5_459e_a8de_73e13c051a13);

/// Discovery filter: `InkP-` name prefix or the service UUID.
pub fn matches_discovery(name: Option<&str>, services: &[Uuid]) -> bool {
    name.is_some_and(|n| n.starts_with(DEVICE_NAME_PREFIX)) || services.contains(&SERVICE_UUID)
}

/// Addresses compare case-insensitively.
pub fn same_address(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Presence notification from the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// The device was seen advertising.
    Advertisement {
        address: String,
        name: Option<String>,
    },
    /// The device went out of range.
    Unavailable { address: String },
}

impl PresenceEvent {
    pub fn address(&self) -> &str {
        match self {
            PresenceEvent::Advertisement { address, .. } | PresenceEvent::Unavailable { address } => {
                address
            }
        }
    }
}

/// Resolves and connects to one device.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Device address this transport talks to.
    fn address(&self) -> &str;

    /// Whether a connectable handle for the device is currently resolvable.
    async fn is_connectable(&self) -> bool;

    /// Opens a connection. Fails with `LinkUnavailable` when the device
    /// cannot be resolved or the timeout elapses.
    async fn connect(&self, timeout: Duration) -> SyncResult<Box<dyn LinkConnection>>;
}

/// One open connection.
#[async_trait]
pub trait LinkConnection: Send {
    async fn read_status(&mut self) -> SyncResult<Vec<u8>>;

    async fn write_command(&mut self, bytes: &[u8], with_response: bool) -> SyncResult<()>;

    async fn disconnect(&mut self) -> SyncResult<()>;
}
