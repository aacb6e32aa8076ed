//! # Cloud API
//!
//! Typed endpoints on top of [`SessionManager::request`]. The trait is the
//! seam the agent and the conversion flow depend on, so tests can script
//! responses without HTTP.
//!
//! | Endpoint | Method | Returns |
//! |---|---|---|
//! | `/frame/status` | GET | `[{uuid: {...}}]` |
//! | `/frame/image-status` | GET | `[{uuid: {...}}]` |
//! | `/frame/version-check` | GET | `[{uuid: {...}}]` |
//! | `/user/frames?limit=100` | GET | `frames` list |
//! | `/user/profile` | GET | profile object |
//! | `/frame/actions` | POST | action result |
//! | `/item/convert` | POST multipart | `{queueId}` |
//! | `/item/is-converted` | POST | `{status, message, item}` |

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use tracing::debug;

use crate::error::SyncResult;
use crate::session::{ApiRequest, FilePart, MultipartForm, SessionManager};

/// Cloud-side actions understood by `/frame/actions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudAction {
    ReportFrameStatus,
    CheckFirmwareUpdate,
}

impl CloudAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudAction::ReportFrameStatus => "REPORT_FRAME_STATUS",
            CloudAction::CheckFirmwareUpdate => "CHECK_FW_UPDATE",
        }
    }
}

impl fmt::Display for CloudAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image handed to `/item/convert`.
#[derive(Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub filename: String,
}

impl ImageUpload {
    pub const DEFAULT_MIME: &'static str = "image/jpeg";
    pub const DEFAULT_FILENAME: &'static str = "userimage.jpg";

    pub fn new(bytes: Vec<u8>, mime: Option<&str>) -> Self {
        ImageUpload {
            bytes,
            mime: mime
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(Self::DEFAULT_MIME)
                .to_string(),
            filename: Self::DEFAULT_FILENAME.to_string(),
        }
    }
}

impl fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageUpload")
            .field("bytes", &self.bytes.len())
            .field("mime", &self.mime)
            .field("filename", &self.filename)
            .finish()
    }
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn frame_status(&self) -> SyncResult<Value>;

    async fn image_status(&self) -> SyncResult<Value>;

    async fn version_check(&self) -> SyncResult<Value>;

    /// Frames registered to the account.
    async fn user_frames(&self) -> SyncResult<Vec<Value>>;

    async fn user_profile(&self) -> SyncResult<Value>;

    async fn send_action(&self, frame_uuids: &[String], actions: &[CloudAction]) -> SyncResult<Value>;

    /// Uploads an image for conversion. The response normally holds `queueId`.
    async fn upload_convert(&self, frame_uuid: &str, image: &ImageUpload) -> SyncResult<Value>;

    async fn is_converted(&self, queue_id: &str) -> SyncResult<Value>;
}

#[async_trait]
impl CloudApi for SessionManager {
    async fn frame_status(&self) -> SyncResult<Value> {
        self.request(&ApiRequest::get("/frame/status")).await
    }

    async fn image_status(&self) -> SyncResult<Value> {
        self.request(&ApiRequest::get("/frame/image-status")).await
    }

    async fn version_check(&self) -> SyncResult<Value> {
        self.request(&ApiRequest::get("/frame/version-check")).await
    }

    async fn user_frames(&self) -> SyncResult<Vec<Value>> {
        let body = self
            .request(&ApiRequest::get("/user/frames").query("limit", "100"))
            .await?;
        Ok(body
            .get("frames")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn user_profile(&self) -> SyncResult<Value> {
        self.request(&ApiRequest::get("/user/profile")).await
    }

    async fn send_action(&self, frame_uuids: &[String], actions: &[CloudAction]) -> SyncResult<Value> {
        let actions: Vec<&str> = actions.iter().map(CloudAction::as_str).collect();
        debug!(frames = ?frame_uuids, ?actions, "Sending cloud action");
        self.request(
            &ApiRequest::post("/frame/actions").json(json!({
                "frames": frame_uuids,
                "actions": actions,
            })),
        )
        .await
    }

    async fn upload_convert(&self, frame_uuid: &str, image: &ImageUpload) -> SyncResult<Value> {
        debug!(
            frame_uuid = %frame_uuid,
            bytes = image.bytes.len(),
            mime = %image.mime,
            "Uploading image for conversion"
        );

        let form = MultipartForm::default()
            .text("frames[]", frame_uuid)
            .file(FilePart {
                field: "file".to_string(),
                filename: image.filename.clone(),
                mime: image.mime.clone(),
                bytes: image.bytes.clone(),
            });

        self.request(
            &ApiRequest::post("/item/convert")
                .header("Upload-Draft-Interop-Version", "6")
                .header("Upload-Complete", "?1")
                .multipart(form),
        )
        .await
    }

    async fn is_converted(&self, queue_id: &str) -> SyncResult<Value> {
        self.request(&ApiRequest::post("/item/is-converted").json(json!({ "queueId": queue_id })))
            .await
    }
}
