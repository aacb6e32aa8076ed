//! # Command Framer
//!
//! Builds authenticated command frames for the command characteristic.
//!
//! ## Frame Layout
//! ```text
//! ┌────────┬──────────────────────────────┬───────────────┐
//! │ header │ payload (compact JSON)       │ mac (4 bytes) │
//! │  0x01  │ {"action":42}                │               │
//! └────────┴──────────────────────────────┴───────────────┘
//!
//! mac = HMAC-SHA256(key, le_u16(msg_seq) ‖ header ‖ payload)[..4]
//! ```
//!
//! `msg_seq` must come from the status read taken in the same connection.
//! A frame is built fresh for every command and never reused.

use crate::error::{CoreError, CoreResult};
use crate::signature::hmac_sha256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One-byte header prefixed to every command.
pub const COMMAND_HEADER: u8 = 0x01;

/// Truncated MAC length.
pub const MAC_LEN: usize = 4;

/// Negotiated MTU; a framed command must fit in a single write.
pub const LINK_MTU: usize = 512;

/// Key used whenever the device does not report secure mode.
pub const FALLBACK_SHARED_KEY_HEX: &str = "b716c1d9807b857fcb26f26fab215c6b";

// =============================================================================
// Actions
// =============================================================================

/// Action codes understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BleAction {
    FactoryReset = 1,
    ApplySettings = 2,
    Reboot = 3,
    Hello = 41,
    FetchImages = 42,
    ListNetworks = 43,
    CleanGhosting = 44,
}

impl BleAction {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for BleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BleAction::FactoryReset => "factory_reset",
            BleAction::ApplySettings => "apply_settings",
            BleAction::Reboot => "reboot",
            BleAction::Hello => "hello",
            BleAction::FetchImages => "fetch_images",
            BleAction::ListNetworks => "list_networks",
            BleAction::CleanGhosting => "clean_ghosting",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Optional fields of the apply-settings action.
///
/// Field order is the wire order; absent fields are omitted entirely.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "apiEnvType", skip_serializing_if = "Option::is_none")]
    pub api_env_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passwd: Option<String>,
}

impl fmt::Debug for SettingsUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("SettingsUpdate")
            .field("user", &self.user)
            .field("token", &redact(&self.token))
            .field("api_env_type", &self.api_env_type)
            .field("ssid", &self.ssid)
            .field("passwd", &redact(&self.passwd))
            .finish()
    }
}

/// A command with its action-specific extra fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCommand {
    FactoryReset,
    ApplySettings(SettingsUpdate),
    Reboot,
    Hello,
    FetchImages,
    ListNetworks,
    CleanGhosting,
}

#[derive(Serialize)]
struct Payload<'a> {
    action: u8,
    #[serde(flatten)]
    settings: Option<&'a SettingsUpdate>,
}

impl FrameCommand {
    pub fn action(&self) -> BleAction {
        match self {
            FrameCommand::FactoryReset => BleAction::FactoryReset,
            FrameCommand::ApplySettings(_) => BleAction::ApplySettings,
            FrameCommand::Reboot => BleAction::Reboot,
            FrameCommand::Hello => BleAction::Hello,
            FrameCommand::FetchImages => BleAction::FetchImages,
            FrameCommand::ListNetworks => BleAction::ListNetworks,
            FrameCommand::CleanGhosting => BleAction::CleanGhosting,
        }
    }

    /// Compact JSON `{"action":N,...extras}`.
    pub fn payload(&self) -> CoreResult<Vec<u8>> {
        let settings = match self {
            FrameCommand::ApplySettings(update) => Some(update),
            _ => None,
        };
        let payload = Payload {
            action: self.action().code(),
            settings,
        };
        Ok(serde_json::to_vec(&payload)?)
    }
}

// =============================================================================
// Shared Key
// =============================================================================

/// Secret used to MAC command frames.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey(Vec<u8>);

impl SharedKey {
    pub fn from_hex(value: &str) -> CoreResult<Self> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| CoreError::InvalidSharedKey(e.to_string()))?;
        if bytes.is_empty() {
            return Err(CoreError::InvalidSharedKey("key is empty".to_string()));
        }
        Ok(Self(bytes))
    }

    /// The well-known key devices accept outside secure mode.
    pub fn fallback() -> Self {
        // The constant is valid hex; decode cannot fail.
        Self(hex::decode(FALLBACK_SHARED_KEY_HEX).unwrap_or_default())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey(<{} bytes>)", self.0.len())
    }
}

// =============================================================================
// Command Frame
// =============================================================================

/// A built, authenticated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub header: u8,
    pub payload: Vec<u8>,
    pub mac: [u8; MAC_LEN],
}

impl CommandFrame {
    pub fn len(&self) -> usize {
        1 + self.payload.len() + MAC_LEN
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Wire bytes: header ‖ payload ‖ mac.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.push(self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.mac);
        out
    }
}

/// `HMAC-SHA256(key, le_u16(seq) ‖ header ‖ payload)[..4]`
pub fn compute_mac(
    key: &SharedKey,
    seq: u16,
    header: u8,
    payload: &[u8],
) -> CoreResult<[u8; MAC_LEN]> {
    let digest = hmac_sha256(
        key.as_bytes(),
        &[&seq.to_le_bytes()[..], &[header][..], payload],
    )?;
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&digest[..MAC_LEN]);
    Ok(mac)
}

/// Build the frame for `command`, signed for sequence number `seq`.
///
/// `key = None` signs with [`SharedKey::fallback`].
pub fn build_command(
    command: &FrameCommand,
    seq: u16,
    key: Option<&SharedKey>,
) -> CoreResult<CommandFrame> {
    let payload = command.payload()?;
    let fallback;
    let key = match key {
        Some(key) => key,
        None => {
            fallback = SharedKey::fallback();
            &fallback
        }
    };
    let mac = compute_mac(key, seq, COMMAND_HEADER, &payload)?;
    let frame = CommandFrame {
        header: COMMAND_HEADER,
        payload,
        mac,
    };
    if frame.len() > LINK_MTU {
        return Err(CoreError::CommandTooLarge {
            size: frame.len(),
            max: LINK_MTU,
        });
    }
    Ok(frame)
}
