//! Client for the upstream generation service
//!
//! Defines the `Upstream` trait the task orchestrator drives, and
//! `HttpUpstream`, the reqwest implementation. The client never retries:
//! the service has a hard ceiling on concurrent jobs, so blind retries only
//! deepen throttling. Failures are returned as a closed `UpstreamError` enum
//! and the caller decides what to do with each kind.

pub mod http;
pub mod wire;

pub use credential_pool::Classification;
pub use http::{HttpUpstream, UpstreamPaths};
pub use wire::{
    Envelope, ExtendRequest, ExtensionOptions, TaskHandle, TaskResult, UpstreamStatus, Video,
};

use std::future::Future;
use std::pin::Pin;

use upstream_auth::Credential;

/// Errors surfaced at the upstream boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamError {
    /// Concurrency or quota rejection; `retry_after` in seconds when upstream sent one
    #[error("upstream throttled: {message}")]
    Throttle {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("content moderation blocked: {message}")]
    ContentModeration { message: String },

    #[error("upstream returned {status} (code {code:?}): {message}")]
    Status {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("invalid upstream response: {0}")]
    Decode(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Request refused before anything was sent (e.g. a malformed task id)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Build an error from a failed response, classifying it.
    pub fn from_response(
        status: u16,
        body: &str,
        code: Option<i64>,
        message: String,
        retry_after: Option<u64>,
    ) -> Self {
        match credential_pool::classify(status, body) {
            Classification::Throttle => UpstreamError::Throttle {
                message,
                retry_after,
            },
            Classification::ContentModeration => UpstreamError::ContentModeration { message },
            Classification::Other => UpstreamError::Status {
                status,
                code,
                message,
            },
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, UpstreamError::Throttle { .. })
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Boxed future returned by `Upstream` methods, for `Arc<dyn Upstream>`.
pub type UpstreamFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The four upstream operations plus single-extension status.
///
/// Every call is authenticated with a token issued just for it. Only `submit`
/// takes an explicit credential: submission is where the orchestrator
/// rotates through the pool on throttling. Reads pick any credential.
pub trait Upstream: Send + Sync {
    /// Create a new generation job from an opaque submission payload.
    fn submit<'a>(
        &'a self,
        credential: &'a Credential,
        payload: &'a serde_json::Value,
    ) -> UpstreamFuture<'a, TaskHandle>;

    /// Current status of a job, with results once terminal.
    fn fetch_status<'a>(&'a self, task_id: &'a str) -> UpstreamFuture<'a, TaskHandle>;

    /// Chain a new job off a previously generated video.
    fn submit_extension<'a>(
        &'a self,
        result_id: &'a str,
        options: &'a ExtensionOptions,
    ) -> UpstreamFuture<'a, TaskHandle>;

    /// Current status of an extension job.
    fn fetch_extension<'a>(&'a self, task_id: &'a str) -> UpstreamFuture<'a, TaskHandle>;

    /// One page of extension jobs (1-based page number).
    fn list_extensions(&self, page: u32, page_size: u32) -> UpstreamFuture<'_, Vec<TaskHandle>>;
}
