//! Upload-then-poll image conversion.
//!
//! ```text
//!   POST /item/convert ──► {queueId}
//!        │                     │
//!        │ no queueId          ▼
//!        └──► returned   POST /item/is-converted ◄──┐
//!                              │ "pending"          │ every 2 s
//!                              ├────────────────────┘ until 120 s
//!                              ▼
//!                        last response (timed_out set on ceiling)
//! ```

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use inkposter_core::ConversionReport;

use crate::cloud::{CloudApi, ImageUpload};
use crate::config::ConversionSettings;
use crate::error::SyncResult;

#[derive(Debug, Clone)]
pub struct ConversionPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ConversionPolicy {
    fn default() -> Self {
        ConversionPolicy {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
        }
    }
}

impl From<&ConversionSettings> for ConversionPolicy {
    fn from(settings: &ConversionSettings) -> Self {
        ConversionPolicy {
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

/// Uploads `image` and polls until the job leaves `pending` or the ceiling
/// elapses. A timeout is reported in the result, not as an error.
pub async fn upload_and_poll(
    cloud: &dyn CloudApi,
    frame_uuid: &str,
    image: &ImageUpload,
    policy: &ConversionPolicy,
) -> SyncResult<ConversionReport> {
    let convert = cloud.upload_convert(frame_uuid, image).await?;

    let queue_id = convert
        .get("queueId")
        .and_then(Value::as_str)
        .filter(|q| !q.is_empty())
        .map(str::to_string);

    let Some(queue_id) = queue_id else {
        info!(frame_uuid = %frame_uuid, "Convert response has no queueId, not polling");
        return Ok(ConversionReport {
            response: convert,
            polls: 0,
            timed_out: false,
        });
    };

    poll_until_converted(cloud, &queue_id, policy).await
}

/// Polls `/item/is-converted` for one queue id.
pub async fn poll_until_converted(
    cloud: &dyn CloudApi,
    queue_id: &str,
    policy: &ConversionPolicy,
) -> SyncResult<ConversionReport> {
    let started = Instant::now();
    let mut polls = 0u32;
    let mut last = Value::Null;

    while started.elapsed() < policy.timeout {
        polls += 1;
        last = cloud.is_converted(queue_id).await?;

        let status = last.get("status").and_then(Value::as_str).unwrap_or("");
        debug!(queue_id = %queue_id, attempt = polls, status = %status, "Conversion poll");

        if status != "pending" {
            info!(queue_id = %queue_id, polls, status = %status, "Conversion finished");
            return Ok(ConversionReport {
                response: last,
                polls,
                timed_out: false,
            });
        }

        tokio::time::sleep(policy.poll_interval).await;
    }

    warn!(
        queue_id = %queue_id,
        polls,
        timeout = ?policy.timeout,
        "Conversion still pending at ceiling"
    );
    Ok(ConversionReport {
        response: last,
        polls,
        timed_out: true,
    })
}
