//! # Sync Agent
//!
//! Orchestrator for one linked frame. Merges slow cloud polling and
//! presence-triggered local polling into a single [`DeviceSnapshot`].
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  ┌───────────────────┐        ┌──────────────────────────────────────┐ │
//! │  │   Cloud loop      │        │   Presence loop (CloudPlusLocal)     │ │
//! │  │   every 300 s     │        │   one PresenceEvent at a time        │ │
//! │  │                   │        │                                      │ │
//! │  │ /frame/status     │        │ needs_poll? ──► read_status_only     │ │
//! │  │ /frame/image-stat │        │                                      │ │
//! │  │ /frame/version-ch │        └──────────────────┬───────────────────┘ │
//! │  └─────────┬─────────┘                           │                     │
//! │            │ replace cloud fields                │ attach local status │
//! │            ▼                                     ▼                     │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │        RwLock<Arc<DeviceSnapshot>>   (single atomic swap)         │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │            │ persisted after every cloud replacement                    │
//! │            ▼                                                            │
//! │      snapshot_cache.<link_id>                                          │
//! │                                                                         │
//! │  On-demand: send_local_command / upload_image / send_cloud_action      │
//! │  Local runs (poll + commands) share one per-link async mutex.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed tick or poll is logged and reported through the emitter. The
//! previous snapshot stays visible and the loops keep running.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use inkposter_core::{
    extract_frame_entry, ConversionReport, DeviceSnapshot, DeviceStatusFrame, FrameCommand,
    SharedKey,
};

use crate::cloud::{CloudAction, CloudApi, ImageUpload};
use crate::config::InkposterConfig;
use crate::conversion::{upload_and_poll, ConversionPolicy};
use crate::device::DeviceSession;
use crate::error::{SyncError, SyncResult};
use crate::link::{same_address, PresenceEvent};
use crate::store::{load_versioned, save_versioned, snapshot_key, StateStore};

// =============================================================================
// Frame Context & Link
// =============================================================================

/// Everything the agent needs to know about one device link.
#[derive(Debug, Clone)]
pub struct FrameContext {
    /// Namespace for persisted records.
    pub link_id: String,
    pub frame_uuid: String,
    /// Device key, only used when the device reports secure mode.
    pub shared_key: Option<SharedKey>,
    pub cloud_poll_interval: Duration,
    pub local_poll_interval: Duration,
    pub conversion: ConversionPolicy,
}

impl FrameContext {
    pub fn new(frame_uuid: impl Into<String>) -> Self {
        let frame_uuid = frame_uuid.into();
        FrameContext {
            link_id: frame_uuid.clone(),
            frame_uuid,
            shared_key: None,
            cloud_poll_interval: Duration::from_secs(300),
            local_poll_interval: Duration::from_secs(300),
            conversion: ConversionPolicy::default(),
        }
    }

    pub fn from_config(config: &InkposterConfig) -> SyncResult<Self> {
        Ok(FrameContext {
            link_id: config.link_id().to_string(),
            frame_uuid: config.frame.uuid.clone(),
            shared_key: config.local.shared_key()?,
            cloud_poll_interval: config.cloud.poll_interval(),
            local_poll_interval: Duration::from_secs(config.local.poll_interval_secs),
            conversion: ConversionPolicy::from(&config.conversion),
        })
    }
}

/// Which channels reach the frame.
#[derive(Clone)]
pub enum FrameLink {
    CloudOnly,
    CloudPlusLocal(DeviceSession),
}

impl FrameLink {
    pub fn local(&self) -> Option<&DeviceSession> {
        match self {
            FrameLink::CloudOnly => None,
            FrameLink::CloudPlusLocal(session) => Some(session),
        }
    }

    fn require_local(&self) -> SyncResult<&DeviceSession> {
        self.local()
            .ok_or_else(|| SyncError::LinkUnavailable("no local link configured".into()))
    }
}

impl std::fmt::Debug for FrameLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameLink::CloudOnly => write!(f, "CloudOnly"),
            FrameLink::CloudPlusLocal(session) => {
                write!(f, "CloudPlusLocal({})", session.address())
            }
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Current agent status for external queries.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    /// Whether the background loops are running.
    pub running: bool,

    /// Last successful cloud tick.
    pub last_cloud_update: Option<DateTime<Utc>>,

    /// Last successful local status read.
    pub last_local_update: Option<DateTime<Utc>>,

    pub cloud_failures: u64,

    pub local_failures: u64,

    /// Last error message (if any).
    pub last_error: Option<String>,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Observer for snapshot changes and failures.
pub trait SyncEventEmitter: Send + Sync {
    /// The snapshot was replaced by a cloud tick.
    fn emit_snapshot(&self, snapshot: &DeviceSnapshot);

    /// A new local status was read.
    fn emit_local_status(&self, status: &DeviceStatusFrame);

    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_snapshot(&self, _snapshot: &DeviceSnapshot) {}
    fn emit_local_status(&self, _status: &DeviceStatusFrame) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Orchestrator for one device link. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncAgent {
    context: Arc<FrameContext>,
    cloud: Arc<dyn CloudApi>,
    store: Arc<dyn StateStore>,
    link: FrameLink,
    snapshot: Arc<RwLock<Arc<DeviceSnapshot>>>,
    status: Arc<RwLock<SyncStatus>>,
    emitter: Arc<dyn SyncEventEmitter>,
    /// Serialises local-link runs for this device.
    link_lock: Arc<Mutex<()>>,
    last_local_poll: Arc<RwLock<Option<Instant>>>,
    host_running: Arc<AtomicBool>,
}

impl SyncAgent {
    pub fn new(
        context: FrameContext,
        cloud: Arc<dyn CloudApi>,
        store: Arc<dyn StateStore>,
        link: FrameLink,
    ) -> Self {
        SyncAgent {
            context: Arc::new(context),
            cloud,
            store,
            link,
            snapshot: Arc::new(RwLock::new(Arc::new(DeviceSnapshot::default()))),
            status: Arc::new(RwLock::new(SyncStatus::default())),
            emitter: Arc::new(NoOpEmitter),
            link_lock: Arc::new(Mutex::new(())),
            last_local_poll: Arc::new(RwLock::new(None)),
            host_running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn context(&self) -> &FrameContext {
        &self.context
    }

    pub fn link(&self) -> &FrameLink {
        &self.link
    }

    /// The current snapshot. Readers never observe a partial update.
    pub async fn snapshot(&self) -> Arc<DeviceSnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Marks whether the host is in a running state. Presence polls only
    /// happen while it is.
    pub fn set_host_running(&self, running: bool) {
        self.host_running.store(running, Ordering::SeqCst);
    }

    // =========================================================================
    // Snapshot Cache
    // =========================================================================

    /// Loads the persisted snapshot so stale data is served before the
    /// first network round-trip. Returns whether one was restored.
    pub async fn restore_cached_snapshot(&self) -> SyncResult<bool> {
        let key = snapshot_key(&self.context.link_id);
        let cached: Option<DeviceSnapshot> =
            load_versioned(self.store.as_ref(), &key, DeviceSnapshot::SCHEMA_VERSION).await?;

        let Some(cached) = cached.filter(|s| !s.is_empty()) else {
            debug!(link_id = %self.context.link_id, "No cached snapshot");
            return Ok(false);
        };

        info!(
            link_id = %self.context.link_id,
            updated_at = ?cached.updated_at,
            "Restored cached snapshot"
        );
        self.emitter.emit_snapshot(&cached);
        *self.snapshot.write().await = Arc::new(cached);
        Ok(true)
    }

    async fn persist_snapshot(&self, snapshot: &DeviceSnapshot) {
        let key = snapshot_key(&self.context.link_id);
        if let Err(e) = save_versioned(
            self.store.as_ref(),
            &key,
            DeviceSnapshot::SCHEMA_VERSION,
            snapshot,
        )
        .await
        {
            warn!(key = %key, ?e, "Failed to persist snapshot");
        }
    }

    // =========================================================================
    // Cloud
    // =========================================================================

    /// One cloud tick: three status GETs, then a wholesale replacement of
    /// the snapshot's cloud fields.
    pub async fn refresh_cloud(&self) -> SyncResult<Arc<DeviceSnapshot>> {
        let fetched = tokio::try_join!(
            self.cloud.frame_status(),
            self.cloud.image_status(),
            self.cloud.version_check(),
        );

        let (frame_status, image_status, version_check) = match fetched {
            Ok(responses) => responses,
            Err(e) => {
                self.record_failure(&e, false).await;
                return Err(e);
            }
        };

        let uuid = &self.context.frame_uuid;
        let mut next = DeviceSnapshot::from_cloud(
            extract_frame_entry(&frame_status, uuid),
            extract_frame_entry(&image_status, uuid),
            extract_frame_entry(&version_check, uuid),
            Utc::now(),
        );

        let next = {
            let mut current = self.snapshot.write().await;
            next.last_local_status = current.last_local_status.clone();
            let next = Arc::new(next);
            *current = Arc::clone(&next);
            next
        };

        self.persist_snapshot(&next).await;

        {
            let mut s = self.status.write().await;
            s.last_cloud_update = next.updated_at;
            s.last_error = None;
        }

        debug!(
            frame_uuid = %uuid,
            battery = ?next.battery_capacity(),
            "Cloud snapshot updated"
        );
        self.emitter.emit_snapshot(&next);
        Ok(next)
    }

    /// Sends cloud-side actions for this frame.
    pub async fn send_cloud_action(&self, actions: &[CloudAction]) -> SyncResult<Value> {
        self.cloud
            .send_action(std::slice::from_ref(&self.context.frame_uuid), actions)
            .await
    }

    /// Upload-then-poll conversion for this frame.
    pub async fn upload_image(&self, image: &ImageUpload) -> SyncResult<ConversionReport> {
        upload_and_poll(
            self.cloud.as_ref(),
            &self.context.frame_uuid,
            image,
            &self.context.conversion,
        )
        .await
    }

    // =========================================================================
    // Local
    // =========================================================================

    /// True when a presence event should trigger a status read.
    pub async fn needs_poll(&self) -> bool {
        if !self.host_running.load(Ordering::SeqCst) {
            return false;
        }
        let Some(session) = self.link.local() else {
            return false;
        };

        let last_poll = *self.last_local_poll.read().await;
        match last_poll {
            None => true,
            Some(last) => {
                last.elapsed() >= self.context.local_poll_interval
                    && session.is_connectable().await
            }
        }
    }

    /// Handles one presence notification. Returns the status read, if a
    /// poll ran.
    pub async fn handle_presence(
        &self,
        event: PresenceEvent,
    ) -> SyncResult<Option<DeviceStatusFrame>> {
        let Some(session) = self.link.local() else {
            return Ok(None);
        };

        if !same_address(event.address(), session.address()) {
            debug!(address = %event.address(), "Ignoring presence event for another device");
            return Ok(None);
        }

        match event {
            PresenceEvent::Unavailable { address } => {
                info!(address = %address, "Frame went out of range");
                Ok(None)
            }
            PresenceEvent::Advertisement { address, name } => {
                debug!(address = %address, ?name, "Frame advertisement");
                if !self.needs_poll().await {
                    return Ok(None);
                }
                self.poll_local().await.map(Some)
            }
        }
    }

    /// Reads the device status and attaches it to the snapshot.
    pub async fn poll_local(&self) -> SyncResult<DeviceStatusFrame> {
        let session = self.link.require_local()?;
        let _guard = self.link_lock.lock().await;

        *self.last_local_poll.write().await = Some(Instant::now());

        match session.read_status_only().await {
            Ok(status) => {
                self.apply_local_status(&status).await;
                Ok(status)
            }
            Err(e) => {
                self.record_failure(&e, true).await;
                Err(e)
            }
        }
    }

    /// Runs the full command handshake over the local link.
    pub async fn send_local_command(&self, command: &FrameCommand) -> SyncResult<DeviceStatusFrame> {
        let session = self.link.require_local()?;
        let _guard = self.link_lock.lock().await;

        let status = session
            .send_command(command, self.context.shared_key.as_ref())
            .await?;
        self.apply_local_status(&status).await;
        Ok(status)
    }

    async fn apply_local_status(&self, status: &DeviceStatusFrame) {
        {
            let mut current = self.snapshot.write().await;
            *current = Arc::new(current.with_local_status(status.clone()));
        }
        {
            let mut s = self.status.write().await;
            s.last_local_update = Some(Utc::now());
        }
        debug!(
            msg_seq = status.msg_seq,
            capacity = status.capacity,
            firmware = %status.firmware_version(),
            "Local status updated"
        );
        self.emitter.emit_local_status(status);
    }

    async fn record_failure(&self, err: &SyncError, local: bool) {
        if local {
            warn!(?err, "Local poll failed");
        } else {
            warn!(?err, "Cloud update failed, keeping previous snapshot");
        }
        {
            let mut s = self.status.write().await;
            if local {
                s.local_failures += 1;
            } else {
                s.cloud_failures += 1;
            }
            s.last_error = Some(err.to_string());
        }
        self.emitter.emit_error(&err.to_string(), err.is_retryable());
    }

    // =========================================================================
    // Background Loops
    // =========================================================================

    /// Spawns the cloud loop and, for a local link, the presence loop.
    pub async fn start(&self, presence_rx: mpsc::Receiver<PresenceEvent>) -> SyncAgentHandle {
        info!(
            link_id = %self.context.link_id,
            frame_uuid = %self.context.frame_uuid,
            link = ?self.link,
            "Starting sync agent"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(self.clone().cloud_loop(shutdown_rx.clone()))];

        if self.link.local().is_some() {
            tasks.push(tokio::spawn(
                self.clone().presence_loop(presence_rx, shutdown_rx),
            ));
        }

        self.status.write().await.running = true;
        self.set_host_running(true);

        SyncAgentHandle {
            agent: self.clone(),
            shutdown_tx,
            tasks,
        }
    }

    async fn cloud_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.context.cloud_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_cloud().await {
                        debug!(retryable = e.is_retryable(), "Cloud tick failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Cloud loop received shutdown");
                    break;
                }
            }
        }

        info!("Cloud loop stopped");
    }

    async fn presence_loop(
        self,
        mut presence_rx: mpsc::Receiver<PresenceEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = presence_rx.recv() => {
                    let Some(event) = event else {
                        info!("Presence channel closed");
                        break;
                    };
                    if let Err(e) = self.handle_presence(event).await {
                        debug!(link_error = e.is_link_error(), "Presence poll failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Presence loop received shutdown");
                    break;
                }
            }
        }

        info!("Presence loop stopped");
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for a running agent.
pub struct SyncAgentHandle {
    agent: SyncAgent,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncAgentHandle {
    pub fn agent(&self) -> &SyncAgent {
        &self.agent
    }

    pub async fn status(&self) -> SyncStatus {
        self.agent.status().await
    }

    pub async fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.agent.snapshot().await
    }

    /// Stops both loops and waits for them to finish their current step.
    pub async fn shutdown(self) {
        info!("Shutting down sync agent");
        self.agent.set_host_running(false);
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                error!(?e, "Sync loop task failed");
            }
        }

        self.agent.status.write().await.running = false;
        info!("Sync agent stopped");
    }
}
