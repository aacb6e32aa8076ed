//! # Configuration
//!
//! Configuration management for one linked frame.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     INKPOSTER_EMAIL=me@example.com                                     │
//! │     INKPOSTER_FRAME_UUID=6a1c...                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/inkposter/inkposter.toml (Linux)                         │
//! │     ~/Library/Application Support/com.inkposter.inkposter/ (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Public API base, 300 s polls, 15 s link connect timeout            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [account]
//! email = "me@example.com"
//! password = "..."
//!
//! [frame]
//! uuid = "6a1c0d2e-..."
//! name = "Living room"
//!
//! [local]
//! address = "AA:BB:CC:DD:EE:FF"   # omit for cloud-only
//! shared_key = "00112233445566778899aabbccddeeff"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use inkposter_core::SharedKey;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Account
// =============================================================================

/// Cloud account credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Cloud Settings
// =============================================================================

/// Cloud API settings. Defaults match the public Android client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// API base URL, without trailing slash.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Client id sent in headers and signed into login requests.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// HMAC secret for login signatures.
    #[serde(default = "default_client_secret")]
    pub client_secret: String,

    #[serde(default = "default_country")]
    pub country: String,

    #[serde(default = "default_language")]
    pub language: String,

    /// Interval between cloud status polls (seconds).
    #[serde(default = "default_cloud_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-request HTTP timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Refresh tokens this long before their absolute expiry (seconds).
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_secs: i64,
}

fn default_base_url() -> String {
    "https://api.inkposter.com/api/v1".to_string()
}

fn default_client_id() -> String {
    "android".to_string()
}

fn default_client_secret() -> String {
    "t5L1zS3D5CAZOE66afhWy8oPVEkZaB5p".to_string()
}

fn default_country() -> String {
    "BE".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_cloud_poll_interval() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

fn default_refresh_buffer() -> i64 {
    inkposter_core::DEFAULT_REFRESH_BUFFER_SECS
}

impl Default for CloudSettings {
    fn default() -> Self {
        CloudSettings {
            base_url: default_base_url(),
            client_id: default_client_id(),
            client_secret: default_client_secret(),
            country: default_country(),
            language: default_language(),
            poll_interval_secs: default_cloud_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            refresh_buffer_secs: default_refresh_buffer(),
        }
    }
}

impl CloudSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Frame
// =============================================================================

/// The frame this host is linked to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Cloud frame UUID; keys every status lookup.
    #[serde(default)]
    pub uuid: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Canonical model, e.g. `Frame_13_3`.
    #[serde(default)]
    pub model: Option<String>,
}

// =============================================================================
// Local Link Settings
// =============================================================================

/// Optional short-range link to the frame.
#[derive(Clone, Serialize, Deserialize)]
pub struct LocalLinkSettings {
    /// Device address; `None` means cloud-only.
    #[serde(default)]
    pub address: Option<String>,

    /// Device-specific key (hex). Only used when the device reports
    /// secure mode.
    #[serde(default)]
    pub shared_key: Option<String>,

    /// Minimum spacing between presence-triggered polls (seconds).
    #[serde(default = "default_local_poll_interval")]
    pub poll_interval_secs: u64,

    /// Connect timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for a single characteristic read or write (seconds).
    #[serde(default = "default_gatt_timeout")]
    pub gatt_timeout_secs: u64,
}

fn default_local_poll_interval() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_gatt_timeout() -> u64 {
    15
}

impl Default for LocalLinkSettings {
    fn default() -> Self {
        LocalLinkSettings {
            address: None,
            shared_key: None,
            poll_interval_secs: default_local_poll_interval(),
            connect_timeout_secs: default_connect_timeout(),
            gatt_timeout_secs: default_gatt_timeout(),
        }
    }
}

impl fmt::Debug for LocalLinkSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLinkSettings")
            .field("address", &self.address)
            .field("shared_key", &self.shared_key.as_ref().map(|_| "<redacted>"))
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("gatt_timeout_secs", &self.gatt_timeout_secs)
            .finish()
    }
}

impl LocalLinkSettings {
    /// Parsed shared key, if configured and non-empty.
    pub fn shared_key(&self) -> SyncResult<Option<SharedKey>> {
        match self.shared_key.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(hex) => Ok(Some(SharedKey::from_hex(hex)?)),
        }
    }
}

// =============================================================================
// Conversion & Storage
// =============================================================================

/// Upload conversion polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionSettings {
    #[serde(default = "default_conversion_poll_interval")]
    pub poll_interval_secs: u64,

    /// Ceiling for the whole poll phase (seconds).
    #[serde(default = "default_conversion_timeout")]
    pub timeout_secs: u64,
}

fn default_conversion_poll_interval() -> u64 {
    2
}

fn default_conversion_timeout() -> u64 {
    120
}

impl Default for ConversionSettings {
    fn default() -> Self {
        ConversionSettings {
            poll_interval_secs: default_conversion_poll_interval(),
            timeout_secs: default_conversion_timeout(),
        }
    }
}

/// Where persisted state lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file; defaults to the platform data dir.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Device Link
// =============================================================================

/// Which channels reach the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLink {
    CloudOnly,
    CloudPlusLocal { address: String },
}

impl DeviceLink {
    pub fn local_address(&self) -> Option<&str> {
        match self {
            DeviceLink::CloudOnly => None,
            DeviceLink::CloudPlusLocal { address } => Some(address),
        }
    }
}

impl fmt::Display for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLink::CloudOnly => write!(f, "cloud-only"),
            DeviceLink::CloudPlusLocal { address } => write!(f, "cloud+local({})", address),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete configuration for one linked frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InkposterConfig {
    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub cloud: CloudSettings,

    #[serde(default)]
    pub frame: FrameConfig,

    #[serde(default)]
    pub local: LocalLinkSettings,

    #[serde(default)]
    pub conversion: ConversionSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl InkposterConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (inkposter.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.account.email.trim().is_empty() || self.account.password.is_empty() {
            return Err(SyncError::InvalidConfig(
                "account.email and account.password are required".into(),
            ));
        }

        if self.frame.uuid.trim().is_empty() {
            return Err(SyncError::InvalidConfig("frame.uuid is required".into()));
        }

        let url = url::Url::parse(&self.cloud.base_url)?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(SyncError::InvalidUrl(format!(
                "cloud.base_url must be http(s), got: {}",
                self.cloud.base_url
            )));
        }

        self.local.shared_key()?;

        let intervals = [
            ("cloud.poll_interval_secs", self.cloud.poll_interval_secs),
            ("cloud.request_timeout_secs", self.cloud.request_timeout_secs),
            ("local.poll_interval_secs", self.local.poll_interval_secs),
            ("local.connect_timeout_secs", self.local.connect_timeout_secs),
            ("local.gatt_timeout_secs", self.local.gatt_timeout_secs),
            ("conversion.poll_interval_secs", self.conversion.poll_interval_secs),
            ("conversion.timeout_secs", self.conversion.timeout_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::InvalidConfig(format!(
                "{} must be greater than 0",
                name
            )));
        }

        if self.cloud.refresh_buffer_secs < 0 {
            return Err(SyncError::InvalidConfig(
                "cloud.refresh_buffer_secs must not be negative".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(email) = std::env::var("INKPOSTER_EMAIL") {
            debug!(email = %email, "Overriding account email from environment");
            self.account.email = email;
        }

        if let Ok(password) = std::env::var("INKPOSTER_PASSWORD") {
            self.account.password = password;
        }

        if let Ok(uuid) = std::env::var("INKPOSTER_FRAME_UUID") {
            debug!(frame_uuid = %uuid, "Overriding frame UUID from environment");
            self.frame.uuid = uuid;
        }

        if let Ok(address) = std::env::var("INKPOSTER_BLE_ADDRESS") {
            let address = address.trim().to_string();
            self.local.address = (!address.is_empty()).then_some(address);
        }

        if let Ok(key) = std::env::var("INKPOSTER_SHARED_KEY") {
            self.local.shared_key = Some(key);
        }

        if let Ok(url) = std::env::var("INKPOSTER_API_BASE") {
            debug!(url = %url, "Overriding API base from environment");
            self.cloud.base_url = url;
        }

        if let Ok(path) = std::env::var("INKPOSTER_DB_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Ok(secs) = std::env::var("INKPOSTER_CLOUD_POLL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.cloud.poll_interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid INKPOSTER_CLOUD_POLL_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("inkposter.toml"))
    }

    /// Returns the database path: configured, or the platform data dir.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage.database_path.clone().or_else(|| {
            Self::project_dirs().map(|dirs| dirs.data_dir().join("inkposter.db"))
        })
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "inkposter", "inkposter")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// The device link variant implied by the local settings.
    pub fn device_link(&self) -> DeviceLink {
        match self.local.address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => DeviceLink::CloudPlusLocal {
                address: address.to_string(),
            },
            _ => DeviceLink::CloudOnly,
        }
    }

    /// Storage namespace for this link's persisted records.
    pub fn link_id(&self) -> &str {
        &self.frame.uuid
    }
}
