//! Error taxonomy for task operations
//!
//! `ErrorKind` is the closed set of categories callers branch on. It is also
//! stored on failed task records so a view can tell a throttled submission
//! from a moderated prompt long after the request that failed.

use serde::{Deserialize, Serialize};
use upstream::UpstreamError;

/// Category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request, rejected before any upstream call
    Validation,
    /// Upstream concurrency/quota rejection, or every credential throttled
    Throttle,
    /// Upstream content-policy rejection; resubmitting the same prompt is pointless
    ContentModeration,
    /// Any other upstream failure
    Upstream,
    /// Task store failure; only ever logged, store errors never reach callers
    Persistence,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Throttle => "throttle_error",
            ErrorKind::ContentModeration => "content_moderation_blocked",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Persistence => "persistence_error",
            ErrorKind::NotFound => "not_found",
        }
    }
}

/// Errors from orchestrator operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("invalid task state: {0}")]
    InvalidState(String),

    #[error("upstream throttled: {message}")]
    Throttle {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("all credentials throttled after {attempts} attempt(s): {message}")]
    Exhausted {
        attempts: usize,
        message: String,
        retry_after: Option<u64>,
    },

    #[error("content moderation blocked: {0}")]
    ContentModeration(String),

    #[error("upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("task not found: {0}")]
    NotFound(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Validation(_) | TaskError::InvalidState(_) => ErrorKind::Validation,
            TaskError::Throttle { .. } | TaskError::Exhausted { .. } => ErrorKind::Throttle,
            TaskError::ContentModeration(_) => ErrorKind::ContentModeration,
            TaskError::Upstream { .. } => ErrorKind::Upstream,
            TaskError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Retry guidance in seconds, when upstream provided one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            TaskError::Throttle { retry_after, .. } | TaskError::Exhausted { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

impl From<UpstreamError> for TaskError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Throttle {
                message,
                retry_after,
            } => TaskError::Throttle {
                message,
                retry_after,
            },
            UpstreamError::ContentModeration { message } => TaskError::ContentModeration(message),
            UpstreamError::Status {
                status, message, ..
            } => TaskError::Upstream {
                status: Some(status),
                message,
            },
            UpstreamError::InvalidRequest(message) => TaskError::Validation(message),
            UpstreamError::PoolExhausted(message) => TaskError::Exhausted {
                attempts: 0,
                message,
                retry_after: None,
            },
            other @ (UpstreamError::Transport(_)
            | UpstreamError::Decode(_)
            | UpstreamError::Auth(_)) => TaskError::Upstream {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

/// Result alias for task operations.
pub type Result<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_map_to_distinct_kinds() {
        let throttle: TaskError = UpstreamError::Throttle {
            message: "busy".into(),
            retry_after: Some(5),
        }
        .into();
        assert_eq!(throttle.kind(), ErrorKind::Throttle);
        assert_eq!(throttle.retry_after(), Some(5));

        let moderated: TaskError = UpstreamError::ContentModeration {
            message: "policy".into(),
        }
        .into();
        assert_eq!(moderated.kind(), ErrorKind::ContentModeration);

        let status: TaskError = UpstreamError::Status {
            status: 400,
            code: Some(1201),
            message: "bad model_name".into(),
        }
        .into();
        assert_eq!(
            status,
            TaskError::Upstream {
                status: Some(400),
                message: "bad model_name".into()
            }
        );

        let transport: TaskError = UpstreamError::Transport("refused".into()).into();
        assert_eq!(transport.kind(), ErrorKind::Upstream);
        assert!(transport.to_string().contains("refused"));
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(ErrorKind::Throttle.as_str(), "throttle_error");
        assert_eq!(ErrorKind::Persistence.as_str(), "persistence_error");
        assert_eq!(
            serde_json::to_value(ErrorKind::ContentModeration).unwrap(),
            "content_moderation"
        );
    }
}
