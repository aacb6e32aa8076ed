//! # Status Codec
//!
//! Decodes the fixed 28-byte status characteristic exposed by the frame.
//!
//! ## Wire Layout (all integers little-endian)
//! ```text
//! ┌────────┬──────┬──────────────────────────────────────────────────────┐
//! │ Offset │ Size │ Field                                                │
//! ├────────┼──────┼──────────────────────────────────────────────────────┤
//! │   0    │  2   │ company_id                                           │
//! │   2    │  2   │ msg_seq      (required for command signing)          │
//! │   4    │  1   │ version                                              │
//! │   5    │  1   │ capacity     (battery %)                             │
//! │   6    │  1   │ wifi_quality                                         │
//! │   7    │  1   │ key_seq                                              │
//! │   8    │  4   │ status bitmask (see StatusFlags)                     │
//! │  12    │  4   │ jobs                                                 │
//! │  16    │  4   │ firmware: major<<24 | minor<<16 | build              │
//! │  20    │  8   │ model string, NUL-terminated or full width           │
//! └────────┴──────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! Frames longer than 28 bytes are accepted; trailing bytes are ignored.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed length of the status characteristic value.
pub const STATUS_FRAME_LEN: usize = 28;

/// Width of the model field at the end of the frame.
pub const MODEL_FIELD_LEN: usize = 8;

// =============================================================================
// Status Frame
// =============================================================================

/// A decoded status read. Ephemeral: recomputed on every local read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusFrame {
    pub company_id: u16,
    pub msg_seq: u16,
    pub version: u8,
    pub capacity: u8,
    pub wifi_quality: u8,
    pub key_seq: u8,
    pub status_bitmask: u32,
    pub jobs: u32,
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub firmware_build: u16,
    pub model: String,
}

impl DeviceStatusFrame {
    /// Decode a raw characteristic value.
    ///
    /// Fails only when fewer than 28 bytes are supplied. The model field is
    /// cut at the first NUL and decoded lossily, so odd bytes never abort.
    pub fn decode(raw: &[u8]) -> CoreResult<Self> {
        if raw.len() < STATUS_FRAME_LEN {
            return Err(CoreError::MalformedFrame {
                expected: STATUS_FRAME_LEN,
                actual: raw.len(),
            });
        }

        let u16_at = |offset: usize| u16::from_le_bytes([raw[offset], raw[offset + 1]]);
        let u32_at = |offset: usize| {
            u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
        };

        let firmware = u32_at(16);
        let model_field = &raw[20..STATUS_FRAME_LEN];
        let model_bytes = model_field
            .split(|b| *b == 0)
            .next()
            .unwrap_or(model_field);

        Ok(Self {
            company_id: u16_at(0),
            msg_seq: u16_at(2),
            version: raw[4],
            capacity: raw[5],
            wifi_quality: raw[6],
            key_seq: raw[7],
            status_bitmask: u32_at(8),
            jobs: u32_at(12),
            firmware_major: (firmware >> 24) as u8,
            firmware_minor: (firmware >> 16) as u8,
            firmware_build: firmware as u16,
            model: String::from_utf8_lossy(model_bytes).into_owned(),
        })
    }

    /// Encode back into the 28-byte wire layout.
    ///
    /// Model strings longer than 8 bytes are truncated; shorter ones are
    /// NUL-padded. Used by tests and device simulators.
    pub fn encode(&self) -> [u8; STATUS_FRAME_LEN] {
        let mut out = [0u8; STATUS_FRAME_LEN];
        out[0..2].copy_from_slice(&self.company_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.msg_seq.to_le_bytes());
        out[4] = self.version;
        out[5] = self.capacity;
        out[6] = self.wifi_quality;
        out[7] = self.key_seq;
        out[8..12].copy_from_slice(&self.status_bitmask.to_le_bytes());
        out[12..16].copy_from_slice(&self.jobs.to_le_bytes());
        let firmware = (u32::from(self.firmware_major) << 24)
            | (u32::from(self.firmware_minor) << 16)
            | u32::from(self.firmware_build);
        out[16..20].copy_from_slice(&firmware.to_le_bytes());
        let model = self.model.as_bytes();
        let len = model.len().min(MODEL_FIELD_LEN);
        out[20..20 + len].copy_from_slice(&model[..len]);
        out
    }

    /// Flags decoded from the status bitmask.
    pub fn flags(&self) -> StatusFlags {
        StatusFlags::from_bitmask(self.status_bitmask)
    }

    /// `major.minor.build`
    pub fn firmware_version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.firmware_major, self.firmware_minor, self.firmware_build
        )
    }

    /// Canonical model for the reported model string, if known.
    pub fn canonical_model(&self) -> Option<FrameModel> {
        resolve_canonical_model(&self.model)
    }
}

/// Free-function form of [`DeviceStatusFrame::decode`].
pub fn decode_status(raw: &[u8]) -> CoreResult<DeviceStatusFrame> {
    DeviceStatusFrame::decode(raw)
}

// =============================================================================
// Status Flags
// =============================================================================

/// Bit positions in the status bitmask.
pub mod flag_bits {
    pub const GENERAL_ERROR: u32 = 0x1;
    pub const BATTERY_LOW: u32 = 0x2;
    pub const BATTERY_CHARGING: u32 = 0x4;
    pub const BATTERY_CHARGING_LOW: u32 = 0x8;
    pub const BATTERY_FULL: u32 = 0x10;
    pub const SECURE_MODE: u32 = 0x40;
    pub const USER_INTERACTION_REQUIRED: u32 = 0x80;
    pub const WIFI_CONNECTION_ERROR: u32 = 0x100;
    pub const WIFI_LINK_OK: u32 = 0x200;
    pub const SERVER_CONNECTION_ERROR: u32 = 0x400;
    pub const SERVER_SOCKET_LINK_OK: u32 = 0x800;
    pub const SYNC_ERROR: u32 = 0x1000;
    pub const FW_UPDATE_ERROR: u32 = 0x2000;
    pub const FW_UPDATE_READY: u32 = 0x10000;
    pub const LAUNCHER_CMD_READY: u32 = 0x20000;
    pub const DATETIME_SYNCED: u32 = 0x40000;

    /// Every defined bit, in declaration order.
    pub const ALL: [u32; 16] = [
        GENERAL_ERROR,
        BATTERY_LOW,
        BATTERY_CHARGING,
        BATTERY_CHARGING_LOW,
        BATTERY_FULL,
        SECURE_MODE,
        USER_INTERACTION_REQUIRED,
        WIFI_CONNECTION_ERROR,
        WIFI_LINK_OK,
        SERVER_CONNECTION_ERROR,
        SERVER_SOCKET_LINK_OK,
        SYNC_ERROR,
        FW_UPDATE_ERROR,
        FW_UPDATE_READY,
        LAUNCHER_CMD_READY,
        DATETIME_SYNCED,
    ];
}

/// Named booleans unpacked from the status bitmask. Derived, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    pub general_error: bool,
    pub battery_low: bool,
    pub battery_charging: bool,
    pub battery_charging_low: bool,
    pub battery_full: bool,
    pub secure_mode: bool,
    pub user_interaction_required: bool,
    pub wifi_connection_error: bool,
    pub wifi_link_ok: bool,
    pub server_connection_error: bool,
    pub server_socket_link_ok: bool,
    pub sync_error: bool,
    pub fw_update_error: bool,
    pub fw_update_ready: bool,
    pub launcher_cmd_ready: bool,
    pub datetime_synced: bool,
}

impl StatusFlags {
    /// Pure bitmask decomposition. Undefined bits are ignored.
    pub fn from_bitmask(bitmask: u32) -> Self {
        use flag_bits::*;
        let set = |mask: u32| bitmask & mask != 0;
        Self {
            general_error: set(GENERAL_ERROR),
            battery_low: set(BATTERY_LOW),
            battery_charging: set(BATTERY_CHARGING),
            battery_charging_low: set(BATTERY_CHARGING_LOW),
            battery_full: set(BATTERY_FULL),
            secure_mode: set(SECURE_MODE),
            user_interaction_required: set(USER_INTERACTION_REQUIRED),
            wifi_connection_error: set(WIFI_CONNECTION_ERROR),
            wifi_link_ok: set(WIFI_LINK_OK),
            server_connection_error: set(SERVER_CONNECTION_ERROR),
            server_socket_link_ok: set(SERVER_SOCKET_LINK_OK),
            sync_error: set(SYNC_ERROR),
            fw_update_error: set(FW_UPDATE_ERROR),
            fw_update_ready: set(FW_UPDATE_READY),
            launcher_cmd_ready: set(LAUNCHER_CMD_READY),
            datetime_synced: set(DATETIME_SYNCED),
        }
    }

    /// Flags as `(name, value)` pairs, in bit order.
    pub fn named(&self) -> [(&'static str, bool); 16] {
        [
            ("general_error", self.general_error),
            ("battery_low", self.battery_low),
            ("battery_charging", self.battery_charging),
            ("battery_charging_low", self.battery_charging_low),
            ("battery_full", self.battery_full),
            ("secure_mode", self.secure_mode),
            ("user_interaction_required", self.user_interaction_required),
            ("wifi_connection_error", self.wifi_connection_error),
            ("wifi_link_ok", self.wifi_link_ok),
            ("server_connection_error", self.server_connection_error),
            ("server_socket_link_ok", self.server_socket_link_ok),
            ("sync_error", self.sync_error),
            ("fw_update_error", self.fw_update_error),
            ("fw_update_ready", self.fw_update_ready),
            ("launcher_cmd_ready", self.launcher_cmd_ready),
            ("datetime_synced", self.datetime_synced),
        ]
    }
}

/// Free-function form of [`StatusFlags::from_bitmask`].
pub fn parse_flags(bitmask: u32) -> StatusFlags {
    StatusFlags::from_bitmask(bitmask)
}

// =============================================================================
// Model Table
// =============================================================================

/// Canonical frame models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameModel {
    #[serde(rename = "Frame_13_3")]
    Frame13_3,
    #[serde(rename = "Frame_28_5")]
    Frame28_5,
    #[serde(rename = "Frame_31_5")]
    Frame31_5,
}

impl FrameModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameModel::Frame13_3 => "Frame_13_3",
            FrameModel::Frame28_5 => "Frame_28_5",
            FrameModel::Frame31_5 => "Frame_31_5",
        }
    }

    /// Native panel resolution as `(width, height)`.
    pub fn resolution(&self) -> (u32, u32) {
        match self {
            FrameModel::Frame13_3 => (1200, 1600),
            FrameModel::Frame28_5 => (2160, 3060),
            FrameModel::Frame31_5 => (2560, 1440),
        }
    }

    /// Map the cloud `modelAlias` to a model.
    pub fn from_cloud_alias(alias: &str) -> Option<Self> {
        match alias {
            "spectra_13_3" => Some(FrameModel::Frame13_3),
            "sharp_28_5" => Some(FrameModel::Frame28_5),
            "spectra_31_5" => Some(FrameModel::Frame31_5),
            _ => None,
        }
    }
}

impl fmt::Display for FrameModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a device-reported model string to its canonical model.
///
/// Unknown strings return `None`; they must not block status display.
pub fn resolve_canonical_model(model: &str) -> Option<FrameModel> {
    match model {
        "W1330" | "Frame_13_3" => Some(FrameModel::Frame13_3),
        "W2850" | "Frame_28_5" => Some(FrameModel::Frame28_5),
        "W3150" | "Frame_31_5" => Some(FrameModel::Frame31_5),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> DeviceStatusFrame {
        DeviceStatusFrame {
            company_id: 0x0A1B,
            msg_seq: 513,
            version: 2,
            capacity: 87,
            wifi_quality: 60,
            key_seq: 1,
            status_bitmask: flag_bits::LAUNCHER_CMD_READY | flag_bits::WIFI_LINK_OK,
            jobs: 3,
            firmware_major: 1,
            firmware_minor: 4,
            firmware_build: 1207,
            model: "W1330".to_string(),
        }
    }

    #[test]
    fn test_decode_known_bytes() {
        let mut raw = [0u8; 28];
        raw[0..2].copy_from_slice(&[0x34, 0x12]);
        raw[2..4].copy_from_slice(&[0x07, 0x00]);
        raw[4] = 1;
        raw[5] = 55;
        raw[6] = 70;
        raw[7] = 9;
        raw[8..12].copy_from_slice(&0x0002_0040u32.to_le_bytes());
        raw[12..16].copy_from_slice(&5u32.to_le_bytes());
        raw[16..20].copy_from_slice(&0x0203_0010u32.to_le_bytes());
        raw[20..25].copy_from_slice(b"W2850");

        let frame = decode_status(&raw).unwrap();
        assert_eq!(frame.company_id, 0x1234);
        assert_eq!(frame.msg_seq, 7);
        assert_eq!(frame.capacity, 55);
        assert_eq!(frame.key_seq, 9);
        assert_eq!(frame.jobs, 5);
        assert_eq!(frame.firmware_version(), "2.3.16");
        assert_eq!(frame.model, "W2850");
        assert_eq!(frame.canonical_model(), Some(FrameModel::Frame28_5));
        assert!(frame.flags().secure_mode);
        assert!(frame.flags().launcher_cmd_ready);
    }

    #[test]
    fn test_decode_short_frame_fails() {
        let err = decode_status(&[0u8; 27]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::MalformedFrame {
                expected: 28,
                actual: 27
            }
        ));
        assert!(decode_status(&[]).is_err());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut raw = sample_frame().encode().to_vec();
        raw.extend_from_slice(&[0xFF; 6]);
        assert_eq!(decode_status(&raw).unwrap(), sample_frame());
    }

    #[test]
    fn test_full_width_model_without_nul() {
        let mut frame = sample_frame();
        frame.model = "ABCDEFGH".to_string();
        assert_eq!(decode_status(&frame.encode()).unwrap().model, "ABCDEFGH");
    }

    #[test]
    fn test_invalid_utf8_model_is_lossy() {
        let mut raw = sample_frame().encode();
        raw[20] = 0xFF;
        raw[21] = b'X';
        raw[22] = 0;
        raw[23] = b'Z';
        let frame = decode_status(&raw).unwrap();
        assert_eq!(frame.model, "\u{FFFD}X");
    }

    #[test]
    fn test_encode_round_trip() {
        let frame = sample_frame();
        assert_eq!(decode_status(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_flags_secure_mode_and_general_error() {
        let expected = StatusFlags {
            general_error: true,
            secure_mode: true,
            ..StatusFlags::default()
        };
        assert_eq!(parse_flags(0x0000_0041), expected);
    }

    #[test]
    fn test_flags_0x42_follows_bit_table() {
        // 0x02 is battery_low in the bit table, not general_error.
        let expected = StatusFlags {
            battery_low: true,
            secure_mode: true,
            ..StatusFlags::default()
        };
        assert_eq!(parse_flags(0x0000_0042), expected);
    }

    #[test]
    fn test_undefined_bits_are_ignored() {
        assert_eq!(parse_flags(0x20 | 0x4000 | 0x8000 | 0xFFF8_0000), StatusFlags::default());
    }

    #[test]
    fn test_named_flags_follow_bit_table() {
        for (i, bit) in flag_bits::ALL.iter().enumerate() {
            let named = parse_flags(*bit).named();
            for (j, (name, value)) in named.iter().enumerate() {
                assert_eq!(*value, i == j, "bit {:#x} vs flag {}", bit, name);
            }
        }
    }

    #[test]
    fn test_model_table() {
        assert_eq!(resolve_canonical_model("W1330"), Some(FrameModel::Frame13_3));
        assert_eq!(resolve_canonical_model("Frame_31_5"), Some(FrameModel::Frame31_5));
        assert_eq!(resolve_canonical_model("W9999"), None);
        assert_eq!(resolve_canonical_model(""), None);
        assert_eq!(FrameModel::from_cloud_alias("sharp_28_5"), Some(FrameModel::Frame28_5));
        assert_eq!(FrameModel::Frame31_5.resolution(), (2560, 1440));
        assert_eq!(FrameModel::Frame13_3.to_string(), "Frame_13_3");
    }
}
