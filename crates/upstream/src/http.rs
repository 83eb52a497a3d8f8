//! reqwest implementation of `Upstream`
//!
//! One request per call: acquire a credential (or use the one given), sign a
//! token for it, send, then classify. Non-2xx statuses and 2xx envelopes with
//! a non-zero business code are both failures.

use std::sync::Arc;
use std::time::Duration;

use credential_pool::{CredentialPool, Exclusions};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use upstream_auth::{Credential, TokenIssuer};

use crate::wire::{Envelope, ExtendRequest, ExtensionOptions, TaskHandle};
use crate::{Result, Upstream, UpstreamError, UpstreamFuture};

/// Paths of the upstream endpoints, relative to the base URL.
#[derive(Debug, Clone)]
pub struct UpstreamPaths {
    /// `POST` creates a job; `GET {submit}/{task_id}` reports its status
    pub submit: String,
    /// `POST` creates an extension; `GET {extend}/{task_id}` and
    /// `GET {extend}?pageNum&pageSize` read them back
    pub extend: String,
}

impl Default for UpstreamPaths {
    fn default() -> Self {
        Self {
            submit: "/v1/videos/text2video".into(),
            extend: "/v1/videos/video-extend".into(),
        }
    }
}

/// HTTP client for the generation service.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    paths: UpstreamPaths,
    timeout: Duration,
    pool: Arc<CredentialPool>,
    issuer: TokenIssuer,
}

impl HttpUpstream {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        paths: UpstreamPaths,
        timeout: Duration,
        pool: Arc<CredentialPool>,
        issuer: TokenIssuer,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            paths,
            timeout,
            pool,
            issuer,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// URL of one job under `collection`. The id is pushed as a single,
    /// percent-encoded path segment so it cannot leave the collection.
    fn item_url(&self, collection: &str, task_id: &str) -> Result<reqwest::Url> {
        if task_id.is_empty()
            || task_id == "."
            || task_id == ".."
            || task_id.contains(['/', '\\', '?', '#'])
        {
            return Err(UpstreamError::InvalidRequest(format!(
                "malformed task id {task_id:?}"
            )));
        }
        let mut url = reqwest::Url::parse(&self.url(collection))
            .map_err(|e| UpstreamError::InvalidRequest(format!("bad upstream url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| UpstreamError::InvalidRequest("upstream url cannot take a path".into()))?
            .pop_if_empty()
            .push(task_id);
        Ok(url)
    }

    /// Any credential will do for reads.
    fn any_credential(&self) -> Result<&Credential> {
        self.pool
            .acquire(&Exclusions::new())
            .map_err(|e| match e {
                credential_pool::Error::PoolExhausted(msg) => UpstreamError::PoolExhausted(msg),
                other => UpstreamError::Auth(other.to_string()),
            })
    }

    /// Sign, send and decode one request.
    async fn execute<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        request: reqwest::RequestBuilder,
        op: &'static str,
    ) -> Result<T> {
        let token = self
            .issuer
            .issue(credential)
            .map_err(|e| UpstreamError::Auth(e.to_string()))?;

        let response = request
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(op, credential_id = credential.id(), error = %e, "upstream request failed");
                UpstreamError::Transport(e.to_string())
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Transport(format!("reading response body: {e}")))?;

        let envelope: Option<Envelope<serde_json::Value>> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let (code, message) = match &envelope {
                Some(env) if !env.message.is_empty() => (Some(env.code), env.message.clone()),
                Some(env) => (Some(env.code), status.to_string()),
                None if !body.trim().is_empty() => (None, body.trim().to_string()),
                None => (None, status.to_string()),
            };
            let err = UpstreamError::from_response(status.as_u16(), &body, code, message, retry_after);
            warn!(op, status = status.as_u16(), credential_id = credential.id(), error = %err, "upstream rejected request");
            return Err(err);
        }

        let envelope = envelope.ok_or_else(|| {
            UpstreamError::Decode(format!("{op}: response is not a JSON envelope"))
        })?;

        if envelope.code != 0 {
            let err = UpstreamError::from_response(
                status.as_u16(),
                &body,
                Some(envelope.code),
                envelope.message,
                retry_after,
            );
            warn!(op, credential_id = credential.id(), error = %err, "upstream returned error code");
            return Err(err);
        }

        let data = envelope
            .data
            .ok_or_else(|| UpstreamError::Decode(format!("{op}: envelope has no data")))?;
        debug!(op, credential_id = credential.id(), request_id = ?envelope.request_id, "upstream call succeeded");
        serde_json::from_value(data).map_err(|e| UpstreamError::Decode(format!("{op}: {e}")))
    }
}

impl Upstream for HttpUpstream {
    fn submit<'a>(
        &'a self,
        credential: &'a Credential,
        payload: &'a serde_json::Value,
    ) -> UpstreamFuture<'a, TaskHandle> {
        Box::pin(async move {
            let request = self.client.post(self.url(&self.paths.submit)).json(payload);
            self.execute(credential, request, "submit").await
        })
    }

    fn fetch_status<'a>(&'a self, task_id: &'a str) -> UpstreamFuture<'a, TaskHandle> {
        Box::pin(async move {
            let url = self.item_url(&self.paths.submit, task_id)?;
            let credential = self.any_credential()?;
            self.execute(credential, self.client.get(url), "fetch_status")
                .await
        })
    }

    fn submit_extension<'a>(
        &'a self,
        result_id: &'a str,
        options: &'a ExtensionOptions,
    ) -> UpstreamFuture<'a, TaskHandle> {
        Box::pin(async move {
            let credential = self.any_credential()?;
            let body = ExtendRequest {
                video_id: result_id.to_string(),
                options: options.clone(),
            };
            let request = self.client.post(self.url(&self.paths.extend)).json(&body);
            self.execute(credential, request, "submit_extension").await
        })
    }

    fn fetch_extension<'a>(&'a self, task_id: &'a str) -> UpstreamFuture<'a, TaskHandle> {
        Box::pin(async move {
            let url = self.item_url(&self.paths.extend, task_id)?;
            let credential = self.any_credential()?;
            self.execute(credential, self.client.get(url), "fetch_extension")
                .await
        })
    }

    fn list_extensions(&self, page: u32, page_size: u32) -> UpstreamFuture<'_, Vec<TaskHandle>> {
        Box::pin(async move {
            let credential = self.any_credential()?;
            let url = self.url(&format!(
                "{}?pageNum={page}&pageSize={page_size}",
                self.paths.extend
            ));
            self.execute(credential, self.client.get(url), "list_extensions")
                .await
        })
    }
}
