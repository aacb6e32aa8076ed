//! # inkposter-sync: Sync Engine for Inkposter Frames
//!
//! Keeps one frame's state current from two sources: the cloud API, polled
//! on a fixed interval, and an optional local BLE link, polled when the
//! frame advertises nearby.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Frame Sync Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncAgent (per-frame orchestrator)               │  │
//! │  │                                                                  │  │
//! │  │  cloud loop: every poll_interval → status + image + version     │  │
//! │  │  presence loop: advertisement → poll_local (≥ 5 min apart)       │  │
//! │  └───────────────┬──────────────────────────────┬───────────────────┘  │
//! │                  │                              │                      │
//! │                  ▼                              ▼                      │
//! │  ┌────────────────────────────┐   ┌──────────────────────────────┐    │
//! │  │ CloudApi / SessionManager  │   │ DeviceSession                │    │
//! │  │                            │   │                              │    │
//! │  │ Signed login, refresh      │   │ connect → status → ready?    │    │
//! │  │ Single 401 retry           │   │ → framed write → status      │    │
//! │  │ Convert upload + polling   │   │ Always disconnects           │    │
//! │  └─────────────┬──────────────┘   └──────────────┬───────────────┘    │
//! │                │                                 │                     │
//! │                ▼                                 ▼                     │
//! │  ┌────────────────────────────┐   ┌──────────────────────────────┐    │
//! │  │ StateStore                 │   │ LinkTransport                │    │
//! │  │ SQLite (inkposter-db) or   │   │ btleplug (feature) or a      │    │
//! │  │ in-memory                  │   │ scripted link in tests       │    │
//! │  └────────────────────────────┘   └──────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - `SyncAgent` orchestrator, status and event emitter
//! - [`cloud`] - Cloud endpoints behind the `CloudApi` trait
//! - [`commands`] - User-facing frame commands (fetch, reboot, uploads...)
//! - [`config`] - TOML configuration with env overrides
//! - [`conversion`] - Upload-then-poll image conversion
//! - [`device`] - One local command run over the BLE link
//! - [`error`] - Sync error types
//! - [`link`] - Transport traits and GATT identifiers
//! - [`session`] - Authenticated HTTP session to the cloud API
//! - [`store`] - Versioned state records
//! - `ble` - btleplug transport (feature `btleplug`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use inkposter_sync::{FrameContext, FrameLink, InkposterConfig, SessionManager, SyncAgent};
//!
//! let config = InkposterConfig::load_or_default(None);
//! let session = SessionManager::new(config.cloud.clone(), credentials, config.link_id(), store.clone())?;
//! let agent = SyncAgent::new(FrameContext::from_config(&config)?, Arc::new(session), store, FrameLink::CloudOnly);
//!
//! let (_presence_tx, presence_rx) = tokio::sync::mpsc::channel(16);
//! let handle = agent.start(presence_rx).await;
//! println!("Battery: {:?}", handle.snapshot().await.battery_capacity());
//! handle.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod cloud;
pub mod commands;
pub mod config;
pub mod conversion;
pub mod device;
pub mod error;
pub mod link;
pub mod session;
pub mod store;

#[cfg(feature = "btleplug")]
pub mod ble;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{
    FrameContext, FrameLink, NoOpEmitter, SyncAgent, SyncAgentHandle, SyncEventEmitter, SyncStatus,
};
pub use cloud::{CloudAction, CloudApi, ImageUpload};
pub use commands::{FrameCommands, UploadOutcome};
pub use config::{DeviceLink, InkposterConfig};
pub use conversion::{upload_and_poll, ConversionPolicy};
pub use device::{DeviceSession, LinkTimings};
pub use error::{SyncError, SyncResult};
pub use link::{LinkConnection, LinkTransport, PresenceEvent};
pub use session::{ApiRequest, MultipartForm, SessionManager};
pub use store::{MemoryStore, StateStore, StoredRecord};

#[cfg(feature = "btleplug")]
pub use ble::BtleplugTransport;
