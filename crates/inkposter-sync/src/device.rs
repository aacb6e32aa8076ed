//! # Device Session
//!
//! One connect/verify/send/verify run against the frame over the local link.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Disconnected ──► Connected ──► StatusRead₁ ──► ready? ──yes──┐         │
//! │                                                  │ no          │         │
//! │                                                  ▼             │         │
//! │                              disconnect, wait 3 s, reconnect   │         │
//! │                                                  │             │         │
//! │                                                  ▼             │         │
//! │                                  StatusRead₂ ──► ready? ──no──► DeviceNotReady
//! │                                                  │ yes         │         │
//! │                                                  ▼             ▼         │
//! │                           KeyDecided (secureMode? device key : fallback) │
//! │                                                  │                       │
//! │                                                  ▼                       │
//! │                      CommandSent (seq from latest read, acked write)     │
//! │                                                  │ settle 1 s            │
//! │                                                  ▼                       │
//! │                               StatusReadFinal ──► Disconnected           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every exit path disconnects. If the future is dropped mid-run, the
//! transport's connection handle is dropped with it and the transport is
//! expected to release the link.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use inkposter_core::{build_command, DeviceStatusFrame, FrameCommand, SharedKey};

use crate::config::LocalLinkSettings;
use crate::error::{SyncError, SyncResult};
use crate::link::{LinkConnection, LinkTransport};

/// Fixed delays and timeouts of one run.
#[derive(Debug, Clone)]
pub struct LinkTimings {
    pub connect_timeout: Duration,
    pub gatt_timeout: Duration,
    /// Wait between the not-ready disconnect and the reconnect.
    pub ready_retry_delay: Duration,
    /// Wait between the command write and the final status read.
    pub settle_delay: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        LinkTimings {
            connect_timeout: Duration::from_secs(15),
            gatt_timeout: Duration::from_secs(15),
            ready_retry_delay: Duration::from_secs(3),
            settle_delay: Duration::from_secs(1),
        }
    }
}

impl From<&LocalLinkSettings> for LinkTimings {
    fn from(settings: &LocalLinkSettings) -> Self {
        LinkTimings {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            gatt_timeout: Duration::from_secs(settings.gatt_timeout_secs),
            ..LinkTimings::default()
        }
    }
}

/// Picks the signing key for a run.
///
/// Outside secure mode the fallback key is used even when a device key was
/// supplied.
pub fn select_key(secure_mode: bool, supplied: Option<&SharedKey>) -> SharedKey {
    match (secure_mode, supplied) {
        (true, Some(key)) => key.clone(),
        (true, None) => {
            warn!("Device is in secure mode but no shared key is configured, using fallback key");
            SharedKey::fallback()
        }
        (false, _) => SharedKey::fallback(),
    }
}

// =============================================================================
// Active Link
// =============================================================================

/// An open connection with per-operation timeouts.
struct ActiveLink {
    conn: Box<dyn LinkConnection>,
    gatt_timeout: Duration,
}

impl ActiveLink {
    async fn read_frame(&mut self) -> SyncResult<DeviceStatusFrame> {
        let raw = tokio::time::timeout(self.gatt_timeout, self.conn.read_status())
            .await
            .map_err(|_| SyncError::LinkFailed("status read timed out".into()))??;
        let frame = DeviceStatusFrame::decode(&raw)?;
        debug!(
            msg_seq = frame.msg_seq,
            bitmask = format_args!("{:#010x}", frame.status_bitmask),
            "Status read"
        );
        Ok(frame)
    }

    async fn write(&mut self, bytes: &[u8]) -> SyncResult<()> {
        tokio::time::timeout(self.gatt_timeout, self.conn.write_command(bytes, true))
            .await
            .map_err(|_| SyncError::LinkFailed("command write timed out".into()))?
    }

    /// Disconnect failures are logged only; the run's own result wins.
    async fn close(mut self) {
        match tokio::time::timeout(self.gatt_timeout, self.conn.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(?e, "Disconnect failed"),
            Err(_) => warn!("Disconnect timed out"),
        }
    }
}

// =============================================================================
// Device Session
// =============================================================================

/// Runs local-link operations against one device.
///
/// Callers serialise runs: one connect/command/disconnect cycle per device
/// at a time.
#[derive(Clone)]
pub struct DeviceSession {
    transport: Arc<dyn LinkTransport>,
    timings: LinkTimings,
}

impl DeviceSession {
    pub fn new(transport: Arc<dyn LinkTransport>, timings: LinkTimings) -> Self {
        DeviceSession { transport, timings }
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    pub fn timings(&self) -> &LinkTimings {
        &self.timings
    }

    /// Whether the transport can currently resolve a connectable handle.
    pub async fn is_connectable(&self) -> bool {
        self.transport.is_connectable().await
    }

    /// Connect, read status, disconnect.
    pub async fn read_status_only(&self) -> SyncResult<DeviceStatusFrame> {
        let mut link = self.open().await?;
        let result = link.read_frame().await;
        link.close().await;
        result
    }

    /// Full handshake: verify readiness (retrying once), send `command`,
    /// and return the status read after the settle delay.
    pub async fn send_command(
        &self,
        command: &FrameCommand,
        shared_key: Option<&SharedKey>,
    ) -> SyncResult<DeviceStatusFrame> {
        let action = command.action();
        info!(address = %self.address(), %action, "Sending local command");

        let mut link = self.open().await?;
        let mut status = link.read_frame().await;
        let is_secure =
            |status: &SyncResult<DeviceStatusFrame>| matches!(status, Ok(s) if s.flags().secure_mode);
        // Once any read shows non-secure mode the fallback key is used.
        let mut secure_mode = is_secure(&status);

        if matches!(&status, Ok(s) if !s.flags().launcher_cmd_ready) {
            info!(
                address = %self.address(),
                retry_in = ?self.timings.ready_retry_delay,
                "Device not ready for commands, reconnecting once"
            );
            link.close().await;
            tokio::time::sleep(self.timings.ready_retry_delay).await;

            link = self.open().await?;
            status = link.read_frame().await;
            secure_mode &= is_secure(&status);

            if matches!(&status, Ok(s) if !s.flags().launcher_cmd_ready) {
                link.close().await;
                warn!(address = %self.address(), %action, "Device still not ready, giving up");
                return Err(SyncError::DeviceNotReady);
            }
        }

        let result = match status {
            Ok(status) => {
                self.execute(&mut link, command, shared_key, secure_mode, &status)
                    .await
            }
            Err(e) => Err(e),
        };
        link.close().await;

        if let Err(e) = &result {
            warn!(address = %self.address(), %action, ?e, "Local command failed");
        }
        result
    }

    async fn execute(
        &self,
        link: &mut ActiveLink,
        command: &FrameCommand,
        shared_key: Option<&SharedKey>,
        secure_mode: bool,
        status: &DeviceStatusFrame,
    ) -> SyncResult<DeviceStatusFrame> {
        let key = select_key(secure_mode, shared_key);
        let frame = build_command(command, status.msg_seq, Some(&key))?;

        debug!(
            msg_seq = status.msg_seq,
            secure_mode,
            bytes = frame.len(),
            "Writing command frame"
        );
        link.write(&frame.to_bytes()).await?;

        tokio::time::sleep(self.timings.settle_delay).await;
        link.read_frame().await
    }

    async fn open(&self) -> SyncResult<ActiveLink> {
        let timeout = self.timings.connect_timeout;
        let conn = tokio::time::timeout(timeout, self.transport.connect(timeout))
            .await
            .map_err(|_| {
                SyncError::LinkUnavailable(format!(
                    "connect to {} timed out after {:?}",
                    self.address(),
                    timeout
                ))
            })??;

        debug!(address = %self.address(), "Connected");
        Ok(ActiveLink {
            conn,
            gatt_timeout: self.timings.gatt_timeout,
        })
    }
}
