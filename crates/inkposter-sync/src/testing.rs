//! Scripted fakes for the cloud and link seams.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use inkposter_core::DeviceStatusFrame;

use crate::cloud::{CloudAction, CloudApi, ImageUpload};
use crate::error::{SyncError, SyncResult};
use crate::link::{LinkConnection, LinkTransport};

pub const LAUNCHER_READY: u32 = inkposter_core::status::flag_bits::LAUNCHER_CMD_READY;
pub const SECURE: u32 = inkposter_core::status::flag_bits::SECURE_MODE;

/// Raw 28-byte status with the given sequence and bitmask.
pub fn status_bytes(msg_seq: u16, status_bitmask: u32) -> Vec<u8> {
    DeviceStatusFrame {
        company_id: 0x0A5E,
        msg_seq,
        version: 1,
        capacity: 80,
        wifi_quality: 3,
        key_seq: 1,
        status_bitmask,
        jobs: 0,
        firmware_major: 1,
        firmware_minor: 4,
        firmware_build: 12,
        model: "W1330".to_string(),
    }
    .encode()
    .to_vec()
}

// =============================================================================
// Link
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Connect,
    Read,
    Write(Vec<u8>),
    Disconnect,
}

#[derive(Default)]
struct LinkScript {
    statuses: VecDeque<Vec<u8>>,
    ops: Vec<(LinkOp, Instant)>,
}

/// Transport that replays a queue of status reads and records every op.
#[derive(Clone)]
pub struct ScriptedLink {
    address: String,
    script: Arc<Mutex<LinkScript>>,
    connectable: Arc<AtomicBool>,
    fail_connect: Arc<AtomicBool>,
}

impl ScriptedLink {
    pub fn new(address: &str) -> Self {
        ScriptedLink {
            address: address.to_string(),
            script: Arc::default(),
            connectable: Arc::new(AtomicBool::new(true)),
            fail_connect: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn push_status(&self, raw: Vec<u8>) {
        self.script.lock().unwrap().statuses.push_back(raw);
    }

    pub fn set_connectable(&self, value: bool) {
        self.connectable.store(value, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, value: bool) {
        self.fail_connect.store(value, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        self.script.lock().unwrap().ops.iter().map(|(op, _)| op.clone()).collect()
    }

    pub fn timed_ops(&self) -> Vec<(LinkOp, Instant)> {
        self.script.lock().unwrap().ops.clone()
    }

    pub fn count(&self, wanted: fn(&LinkOp) -> bool) -> usize {
        self.ops().iter().filter(|op| wanted(op)).count()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                LinkOp::Write(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: LinkOp) {
        self.script.lock().unwrap().ops.push((op, Instant::now()));
    }
}

#[async_trait]
impl LinkTransport for ScriptedLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn is_connectable(&self) -> bool {
        self.connectable.load(Ordering::SeqCst)
    }

    async fn connect(&self, _timeout: Duration) -> SyncResult<Box<dyn LinkConnection>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SyncError::LinkUnavailable(format!("{} not found", self.address)));
        }
        self.record(LinkOp::Connect);
        Ok(Box::new(ScriptedConnection { link: self.clone() }))
    }
}

struct ScriptedConnection {
    link: ScriptedLink,
}

#[async_trait]
impl LinkConnection for ScriptedConnection {
    async fn read_status(&mut self) -> SyncResult<Vec<u8>> {
        self.link.record(LinkOp::Read);
        self.link
            .script
            .lock()
            .unwrap()
            .statuses
            .pop_front()
            .ok_or_else(|| SyncError::LinkFailed("status script exhausted".into()))
    }

    async fn write_command(&mut self, bytes: &[u8], _with_response: bool) -> SyncResult<()> {
        self.link.record(LinkOp::Write(bytes.to_vec()));
        Ok(())
    }

    async fn disconnect(&mut self) -> SyncResult<()> {
        self.link.record(LinkOp::Disconnect);
        Ok(())
    }
}

// =============================================================================
// Cloud
// =============================================================================

/// Cloud double with canned responses and a call log.
pub struct FakeCloud {
    pub frame_status: Mutex<Value>,
    pub image_status: Mutex<Value>,
    pub version_check: Mutex<Value>,
    pub fail_status: AtomicBool,
    pub convert_response: Mutex<Value>,
    pub conversion_polls: Mutex<VecDeque<Value>>,
    pub calls: Mutex<Vec<(String, Instant)>>,
    pub actions: Mutex<Vec<(Vec<String>, Vec<CloudAction>)>>,
    pub uploads: Mutex<Vec<(String, ImageUpload)>>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        FakeCloud {
            frame_status: Mutex::new(json!([])),
            image_status: Mutex::new(json!([])),
            version_check: Mutex::new(json!([])),
            fail_status: AtomicBool::new(false),
            convert_response: Mutex::new(json!({"queueId": "q1"})),
            conversion_polls: Mutex::default(),
            calls: Mutex::default(),
            actions: Mutex::default(),
            uploads: Mutex::default(),
        }
    }
}

impl FakeCloud {
    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(n, _)| n == name).count()
    }

    pub fn call_times(&self, name: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, at)| *at)
            .collect()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push((name.to_string(), Instant::now()));
    }

    fn status_response(&self, name: &str, value: &Mutex<Value>) -> SyncResult<Value> {
        self.record(name);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(SyncError::RequestFailed {
                method: "GET".into(),
                path: format!("/frame/{}", name),
                status: 503,
            });
        }
        Ok(value.lock().unwrap().clone())
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn frame_status(&self) -> SyncResult<Value> {
        self.status_response("status", &self.frame_status)
    }

    async fn image_status(&self) -> SyncResult<Value> {
        self.status_response("image-status", &self.image_status)
    }

    async fn version_check(&self) -> SyncResult<Value> {
        self.status_response("version-check", &self.version_check)
    }

    async fn user_frames(&self) -> SyncResult<Vec<Value>> {
        self.record("user-frames");
        Ok(Vec::new())
    }

    async fn user_profile(&self) -> SyncResult<Value> {
        self.record("user-profile");
        Ok(json!({}))
    }

    async fn send_action(&self, frame_uuids: &[String], actions: &[CloudAction]) -> SyncResult<Value> {
        self.record("actions");
        self.actions
            .lock()
            .unwrap()
            .push((frame_uuids.to_vec(), actions.to_vec()));
        Ok(json!({}))
    }

    async fn upload_convert(&self, frame_uuid: &str, image: &ImageUpload) -> SyncResult<Value> {
        self.record("convert");
        self.uploads
            .lock()
            .unwrap()
            .push((frame_uuid.to_string(), image.clone()));
        Ok(self.convert_response.lock().unwrap().clone())
    }

    async fn is_converted(&self, _queue_id: &str) -> SyncResult<Value> {
        self.record("is-converted");
        Ok(self
            .conversion_polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| json!({"status": "pending"})))
    }
}
