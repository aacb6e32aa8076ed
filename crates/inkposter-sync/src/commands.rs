//! # Frame Commands
//!
//! The command surface hosts expose. Each command maps either to a local
//! command frame or to a cloud call.
//!
//! | Command | Channel |
//! |---|---|
//! | trigger_fetch | local `FetchImages` (42) |
//! | reboot | local `Reboot` (3) |
//! | clean_ghosting | local `CleanGhosting` (44) |
//! | factory_reset | local `FactoryReset` (1) |
//! | apply_settings | local `ApplySettings` (2) |
//! | upload_image_by_url / _by_inline_data | cloud convert, then local fetch |
//! | refresh_status | cloud `REPORT_FRAME_STATUS`, then a cloud tick |
//! | check_firmware_update | cloud `CHECK_FW_UPDATE` |
//!
//! Errors surface to the caller. Nothing here retries.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use inkposter_core::{ConversionReport, DeviceSnapshot, DeviceStatusFrame, FrameCommand, SettingsUpdate};

use crate::agent::SyncAgent;
use crate::cloud::{CloudAction, ImageUpload};
use crate::error::{SyncError, SyncResult};

/// Result of an image upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub conversion: ConversionReport,
    /// Status after the follow-up local fetch, when it ran and succeeded.
    pub fetch_status: Option<DeviceStatusFrame>,
    /// Snapshot after the follow-up cloud tick, when it succeeded.
    pub snapshot: Option<Arc<DeviceSnapshot>>,
}

/// Splits `data:<mime>;base64,<payload>` into its parts.
fn split_data_url(data: &str) -> (Option<&str>, &str) {
    let data = data.trim();
    let Some(rest) = data.strip_prefix("data:") else {
        return (None, data);
    };
    match rest.split_once(',') {
        Some((meta, payload)) => {
            let mime = meta.trim_end_matches(";base64");
            (Some(mime).filter(|m| !m.is_empty()), payload)
        }
        None => (None, rest),
    }
}

pub struct FrameCommands {
    agent: SyncAgent,
    http: reqwest::Client,
}

impl FrameCommands {
    pub fn new(agent: SyncAgent) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(FrameCommands { agent, http })
    }

    pub fn agent(&self) -> &SyncAgent {
        &self.agent
    }

    // =========================================================================
    // Local Commands
    // =========================================================================

    pub async fn trigger_fetch(&self) -> SyncResult<DeviceStatusFrame> {
        self.agent.send_local_command(&FrameCommand::FetchImages).await
    }

    pub async fn reboot(&self) -> SyncResult<DeviceStatusFrame> {
        self.agent.send_local_command(&FrameCommand::Reboot).await
    }

    pub async fn clean_ghosting(&self) -> SyncResult<DeviceStatusFrame> {
        self.agent.send_local_command(&FrameCommand::CleanGhosting).await
    }

    pub async fn factory_reset(&self) -> SyncResult<DeviceStatusFrame> {
        warn!(frame_uuid = %self.agent.context().frame_uuid, "Factory reset requested");
        self.agent.send_local_command(&FrameCommand::FactoryReset).await
    }

    pub async fn apply_settings(&self, settings: SettingsUpdate) -> SyncResult<DeviceStatusFrame> {
        self.agent
            .send_local_command(&FrameCommand::ApplySettings(settings))
            .await
    }

    // =========================================================================
    // Cloud Commands
    // =========================================================================

    /// Asks the frame to report in, then runs a cloud tick.
    pub async fn refresh_status(&self) -> SyncResult<Arc<DeviceSnapshot>> {
        self.agent
            .send_cloud_action(&[CloudAction::ReportFrameStatus])
            .await?;
        self.agent.refresh_cloud().await
    }

    pub async fn check_firmware_update(&self) -> SyncResult<Value> {
        self.agent
            .send_cloud_action(&[CloudAction::CheckFirmwareUpdate])
            .await
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    /// Downloads an image and uploads it.
    pub async fn upload_image_by_url(&self, url: &str) -> SyncResult<UploadOutcome> {
        let parsed = url::Url::parse(url)?;
        info!(url = %parsed, "Downloading image");

        let response = self.http.get(parsed.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RequestFailed {
                method: "GET".into(),
                path: parsed.to_string(),
                status: status.as_u16(),
            });
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_string());
        let bytes = response.bytes().await?;

        self.upload_image_bytes(bytes.to_vec(), mime.as_deref()).await
    }

    /// Uploads base64 data. A `data:` URL prefix is accepted and its mime
    /// type wins over `mime`.
    pub async fn upload_image_by_inline_data(
        &self,
        data: &str,
        mime: Option<&str>,
    ) -> SyncResult<UploadOutcome> {
        let (embedded_mime, payload) = split_data_url(data);
        let bytes = STANDARD
            .decode(payload)
            .map_err(|e| SyncError::InvalidImage(format!("invalid base64: {}", e)))?;
        self.upload_image_bytes(bytes, embedded_mime.or(mime)).await
    }

    /// Upload, poll conversion, best-effort local fetch, then a cloud tick.
    pub async fn upload_image_bytes(
        &self,
        bytes: Vec<u8>,
        mime: Option<&str>,
    ) -> SyncResult<UploadOutcome> {
        if bytes.is_empty() {
            return Err(SyncError::InvalidImage("image is empty".into()));
        }

        let image = ImageUpload::new(bytes, mime);
        let conversion = self.agent.upload_image(&image).await?;
        info!(
            status = ?conversion.status(),
            polls = conversion.polls,
            timed_out = conversion.timed_out,
            "Upload finished"
        );

        let fetch_status = if self.agent.link().local().is_some() {
            match self.trigger_fetch().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(?e, "Local fetch after upload failed");
                    None
                }
            }
        } else {
            None
        };

        let snapshot = match self.agent.refresh_cloud().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(?e, "Cloud refresh after upload failed");
                None
            }
        };

        Ok(UploadOutcome {
            conversion,
            fetch_status,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{FrameContext, FrameLink};
    use crate::device::{DeviceSession, LinkTimings};
    use crate::store::MemoryStore;
    use crate::testing::{status_bytes, FakeCloud, ScriptedLink, LAUNCHER_READY};
    use inkposter_core::build_command;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn commands(cloud: &Arc<FakeCloud>, link: Option<&ScriptedLink>) -> FrameCommands {
        let frame_link = match link {
            Some(link) => FrameLink::CloudPlusLocal(DeviceSession::new(
                Arc::new(link.clone()),
                LinkTimings::default(),
            )),
            None => FrameLink::CloudOnly,
        };
        let agent = SyncAgent::new(
            FrameContext::new("frameA"),
            cloud.clone(),
            Arc::new(MemoryStore::new()),
            frame_link,
        );
        FrameCommands::new(agent).unwrap()
    }

    #[test]
    fn test_split_data_url() {
        assert_eq!(
            split_data_url("data:image/png;base64,AAAA"),
            (Some("image/png"), "AAAA")
        );
        assert_eq!(split_data_url(" AAAA "), (None, "AAAA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_upload_then_fetch_then_refresh() {
        let cloud = Arc::new(FakeCloud::default());
        cloud
            .conversion_polls
            .lock()
            .unwrap()
            .push_back(json!({"status": "done", "item": "x"}));
        let link = ScriptedLink::new("AA:BB");
        link.push_status(status_bytes(11, LAUNCHER_READY));
        link.push_status(status_bytes(12, LAUNCHER_READY));

        let commands = commands(&cloud, Some(&link));
        let data = STANDARD.encode(b"png-bytes");
        let outcome = commands
            .upload_image_by_inline_data(&format!("data:image/png;base64,{}", data), None)
            .await
            .unwrap();

        assert_eq!(outcome.conversion.status(), Some("done"));
        assert_eq!(outcome.fetch_status.unwrap().msg_seq, 12);
        assert!(outcome.snapshot.is_some());

        let uploads = cloud.uploads.lock().unwrap();
        assert_eq!(uploads[0].1.mime, "image/png");
        assert_eq!(uploads[0].1.bytes, b"png-bytes");

        let fetch = build_command(&FrameCommand::FetchImages, 11, None).unwrap();
        assert_eq!(link.writes(), vec![fetch.to_bytes()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_after_upload_is_not_fatal() {
        let cloud = Arc::new(FakeCloud::default());
        cloud
            .conversion_polls
            .lock()
            .unwrap()
            .push_back(json!({"status": "done"}));
        let link = ScriptedLink::new("AA:BB");
        link.fail_connect(true);

        let outcome = commands(&cloud, Some(&link))
            .upload_image_bytes(vec![1, 2, 3], None)
            .await
            .unwrap();
        assert!(outcome.fetch_status.is_none());
        assert_eq!(cloud.call_count("status"), 1);
    }

    #[tokio::test]
    async fn test_invalid_inline_data() {
        let cloud = Arc::new(FakeCloud::default());
        let err = commands(&cloud, None)
            .upload_image_by_inline_data("not base64!!", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidImage(_)));
        assert_eq!(cloud.call_count("convert"), 0);
    }

    #[tokio::test]
    async fn test_refresh_status_reports_then_ticks() {
        let cloud = Arc::new(FakeCloud::default());
        commands(&cloud, None).refresh_status().await.unwrap();

        let actions = cloud.actions.lock().unwrap();
        assert_eq!(actions[0].0, vec!["frameA".to_string()]);
        assert_eq!(actions[0].1, vec![CloudAction::ReportFrameStatus]);
        assert_eq!(cloud.call_count("status"), 1);
    }

    #[tokio::test]
    async fn test_check_firmware_update() {
        let cloud = Arc::new(FakeCloud::default());
        commands(&cloud, None).check_firmware_update().await.unwrap();
        assert_eq!(
            cloud.actions.lock().unwrap()[0].1,
            vec![CloudAction::CheckFirmwareUpdate]
        );
    }

    #[tokio::test]
    async fn test_local_command_without_link() {
        let cloud = Arc::new(FakeCloud::default());
        let err = commands(&cloud, None).reboot().await.unwrap_err();
        assert!(matches!(err, SyncError::LinkUnavailable(_)));
    }

    #[tokio::test]
    async fn test_upload_by_url_uses_served_mime() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/photo"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png; charset=binary")
                    .set_body_bytes(b"png".to_vec()),
            )
            .mount(&server)
            .await;

        let cloud = Arc::new(FakeCloud::default());
        cloud
            .conversion_polls
            .lock()
            .unwrap()
            .push_back(json!({"status": "done"}));

        let outcome = commands(&cloud, None)
            .upload_image_by_url(&format!("{}/photo", server.uri()))
            .await
            .unwrap();
        assert!(outcome.fetch_status.is_none());
        assert_eq!(cloud.uploads.lock().unwrap()[0].1.mime, "image/png");
    }

    #[tokio::test]
    async fn test_upload_by_url_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cloud = Arc::new(FakeCloud::default());
        let err = commands(&cloud, None)
            .upload_image_by_url(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RequestFailed { status: 404, .. }));
    }
}
