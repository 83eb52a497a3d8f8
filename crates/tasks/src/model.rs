//! The canonical task record and its projections
//!
//! `GenerationTask` is stored as-is (serde) and projected onto the upstream
//! wire shape with `to_handle`. There is no second "payload" or "database"
//! struct with its own copy of the field list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use upstream::{ExtendRequest, ExtensionOptions, TaskHandle, TaskResult, UpstreamStatus, Video};

use crate::error::{ErrorKind, Result, TaskError};

/// Upper bound on prompt length accepted upstream.
pub const MAX_PROMPT_CHARS: usize = 2500;

/// Keys that describe a task's runtime state rather than its request.
/// Stripped from templates so a reused template never carries an identity.
const RUNTIME_KEYS: &[&str] = &[
    "task_id",
    "task_status",
    "task_status_msg",
    "task_result",
    "status",
    "result_id",
    "result_urls",
    "error_message",
    "created_at",
    "updated_at",
];

/// Task lifecycle. `Succeeded` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    /// Position in the lifecycle; statuses never move to a lower rank.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Succeeded | TaskStatus::Failed => 2,
        }
    }

    pub fn to_upstream(self) -> UpstreamStatus {
        match self {
            TaskStatus::Pending => UpstreamStatus::Submitted,
            TaskStatus::Processing => UpstreamStatus::Processing,
            TaskStatus::Succeeded => UpstreamStatus::Succeed,
            TaskStatus::Failed => UpstreamStatus::Failed,
        }
    }
}

impl From<UpstreamStatus> for TaskStatus {
    fn from(status: UpstreamStatus) -> Self {
        match status {
            UpstreamStatus::Submitted => TaskStatus::Pending,
            UpstreamStatus::Processing => TaskStatus::Processing,
            UpstreamStatus::Succeed => TaskStatus::Succeeded,
            UpstreamStatus::Failed => TaskStatus::Failed,
        }
    }
}

/// Opaque payload a job was submitted with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionParams(serde_json::Value);

impl SubmissionParams {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Reject payloads upstream would refuse anyway: non-objects, and
    /// objects with neither a prompt nor a source image.
    pub fn validate(&self) -> Result<()> {
        let object = self
            .0
            .as_object()
            .ok_or_else(|| TaskError::Validation("submission payload must be a JSON object".into()))?;

        let prompt = match object.get("prompt") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.as_str()),
            Some(_) => return Err(TaskError::Validation("prompt must be a string".into())),
        };
        if let Some(prompt) = prompt
            && prompt.chars().count() > MAX_PROMPT_CHARS
        {
            return Err(TaskError::Validation(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }

        let has_prompt = prompt.is_some_and(|p| !p.trim().is_empty());
        let has_image = object
            .get("image")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.trim().is_empty());
        if !has_prompt && !has_image {
            return Err(TaskError::Validation(
                "submission needs a non-empty prompt or image".into(),
            ));
        }
        Ok(())
    }

    /// Copy of these params with any runtime keys removed.
    pub fn template(&self) -> SubmissionParams {
        let mut value = self.0.clone();
        if let Some(object) = value.as_object_mut() {
            for key in RUNTIME_KEYS {
                object.remove(*key);
            }
        }
        SubmissionParams(value)
    }
}

/// Validate extension options before anything is sent upstream.
pub fn validate_extension(options: &ExtensionOptions) -> Result<()> {
    if let Some(scale) = options.cfg_scale
        && !(0.0..=1.0).contains(&scale)
    {
        return Err(TaskError::Validation(format!(
            "cfg_scale must be within [0, 1], got {scale}"
        )));
    }
    if let Some(prompt) = &options.prompt
        && prompt.chars().count() > MAX_PROMPT_CHARS
    {
        return Err(TaskError::Validation(format!(
            "prompt exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }
    Ok(())
}

/// One upstream generation job tracked end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    /// Client-local id, stable for the lifetime of the record
    pub id: String,
    /// Workspace/project the task belongs to; pagination is per scope
    pub scope: String,
    /// Upstream job id, set once submission succeeds
    pub task_id: Option<String>,
    /// Upstream artifact id, set on success; keys extension requests
    pub result_id: Option<String>,
    pub status: TaskStatus,
    pub submission_params: SubmissionParams,
    #[serde(default)]
    pub result_urls: Vec<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub is_extension: bool,
    /// For extensions: the result id this task extends
    pub origin: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationTask {
    /// Fresh skeleton for a submission that has not reached upstream yet.
    pub fn skeleton(scope: &str, params: SubmissionParams) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            task_id: None,
            result_id: None,
            status: TaskStatus::Pending,
            submission_params: params,
            result_urls: Vec::new(),
            error_message: None,
            error_kind: None,
            is_extension: false,
            origin: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Skeleton for an extension of `origin_result_id`. The extend request
    /// itself is kept as the submission params so it can be reused.
    pub fn extension_skeleton(
        scope: &str,
        origin_result_id: &str,
        options: &ExtensionOptions,
    ) -> Self {
        let request = ExtendRequest {
            video_id: origin_result_id.to_string(),
            options: options.clone(),
        };
        let params = serde_json::to_value(&request).unwrap_or(serde_json::Value::Null);
        let mut task = Self::skeleton(scope, SubmissionParams::new(params));
        task.is_extension = true;
        task.origin = Some(origin_result_id.to_string());
        task
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a failure. No-op if the task is already terminal.
    pub fn mark_failed(&mut self, message: impl Into<String>, kind: ErrorKind) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(message.into());
        self.error_kind = Some(kind);
        self.result_urls.clear();
        self.updated_at = Utc::now();
        true
    }

    /// Projection onto the upstream task shape. `None` until submitted.
    pub fn to_handle(&self) -> Option<TaskHandle> {
        let task_id = self.task_id.clone()?;
        let task_result = (self.status == TaskStatus::Succeeded).then(|| TaskResult {
            videos: self
                .result_urls
                .iter()
                .enumerate()
                .map(|(index, url)| Video {
                    id: match (&self.result_id, index) {
                        (Some(id), 0) => id.clone(),
                        (Some(id), n) => format!("{id}-{n}"),
                        (None, n) => n.to_string(),
                    },
                    url: url.clone(),
                    duration: None,
                })
                .collect(),
        });
        Some(TaskHandle {
            task_id,
            task_status: self.status.to_upstream(),
            task_status_msg: self.error_message.clone(),
            task_result,
            created_at: self.created_at.timestamp_millis(),
            updated_at: self.updated_at.timestamp_millis(),
        })
    }
}
