//! Wire shapes of the generation service
//!
//! Every response is wrapped in a `{code, message, request_id, data}`
//! envelope. Submit, status and list calls all return the same task shape,
//! with the status message and results present only once known.

use serde::{Deserialize, Serialize};

/// Response envelope. `code == 0` means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub data: Option<T>,
}

/// Upstream task status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    Submitted,
    Processing,
    Succeed,
    Failed,
}

impl UpstreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamStatus::Submitted => "submitted",
            UpstreamStatus::Processing => "processing",
            UpstreamStatus::Succeed => "succeed",
            UpstreamStatus::Failed => "failed",
        }
    }
}

/// One generated artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub videos: Vec<Video>,
}

/// A task as reported by upstream: the submit acknowledgement, a status
/// poll, or one entry of an extension listing.
///
/// `created_at`/`updated_at` are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    pub task_status: UpstreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_result: Option<TaskResult>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl TaskHandle {
    /// Artifacts attached to a finished task, empty otherwise.
    pub fn videos(&self) -> &[Video] {
        self.task_result
            .as_ref()
            .map(|r| r.videos.as_slice())
            .unwrap_or(&[])
    }
}

/// Optional knobs for an extension job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Body of `POST extend`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub video_id: String,
    #[serde(flatten)]
    pub options: ExtensionOptions,
}
