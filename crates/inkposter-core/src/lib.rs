//! # inkposter-core: Pure Protocol Logic for Inkposter Frames
//!
//! This crate contains the wire formats and domain types of the integration
//! as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Inkposter Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  inkposter-sync (orchestration)                 │   │
//! │  │   SessionManager ─► CloudApi        DeviceSession ─► Link       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ inkposter-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │ signature │  │  status   │  │  command  │  │   types   │  │   │
//! │  │   │ HMAC sign │  │ 28-byte   │  │ header +  │  │ tokens,   │  │   │
//! │  │   │ login     │  │ frame +   │  │ JSON +    │  │ snapshot  │  │   │
//! │  │   │ requests  │  │ flags     │  │ 4-byte MAC│  │ identity  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`signature`] - HMAC-SHA256 request signatures
//! - [`status`] - Status frame codec, status flags, model table
//! - [`command`] - Authenticated command frames
//! - [`types`] - Credentials, tokens, snapshots
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use inkposter_core::command::{build_command, FrameCommand};
//! use inkposter_core::status::parse_flags;
//!
//! let flags = parse_flags(0x0002_0040);
//! assert!(flags.secure_mode && flags.launcher_cmd_ready);
//!
//! let frame = build_command(&FrameCommand::FetchImages, 7, None).unwrap();
//! assert_eq!(frame.to_bytes()[0], 0x01);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod command;
pub mod error;
pub mod signature;
pub mod status;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use command::{build_command, BleAction, CommandFrame, FrameCommand, SettingsUpdate, SharedKey};
pub use error::{CoreError, CoreResult};
pub use signature::compute_auth_signature;
pub use status::{decode_status, parse_flags, resolve_canonical_model, DeviceStatusFrame, FrameModel, StatusFlags};
pub use types::*;
