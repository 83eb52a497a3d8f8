//! Local task API
//!
//! Request bodies are read as raw bytes and decoded here so malformed JSON
//! gets the same error envelope as every other failure.

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tasks::{GenerationTask, SubmissionParams, SubmitFailure};
use tracing::{debug, info, instrument, warn};
use upstream::{ExtensionOptions, TaskHandle};

use crate::AppState;
use crate::error::{ApiError, success};
use crate::service::ServiceMetrics;

/// Upper bound on pages served by one scope request.
const MAX_PAGE: usize = 1000;

/// Per-request bookkeeping: id, timing, in-flight count.
struct RequestScope {
    route: &'static str,
    request_id: String,
    started: Instant,
    metrics: ServiceMetrics,
}

impl RequestScope {
    fn start(state: &AppState, route: &'static str) -> Self {
        state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
        state.metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            route,
            request_id: format!("req_{}", uuid::Uuid::new_v4().as_simple()),
            started: Instant::now(),
            metrics: state.metrics.clone(),
        }
    }

    fn finish(self, result: Result<Response, ApiError>) -> Response {
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request_id = %self.request_id,
                    route = self.route,
                    kind = err.kind().as_str(),
                    error = %err,
                    "request failed"
                );
                err.into_response_with(&self.request_id)
            }
        };
        crate::metrics::record_request(
            self.route,
            response.status().as_u16(),
            self.started.elapsed().as_secs_f64(),
        );
        response
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

fn scope_or_default(state: &AppState, scope: Option<String>) -> Result<String, ApiError> {
    match scope {
        None => Ok(state.default_scope.to_string()),
        Some(s) if s.trim().is_empty() => Err(ApiError::BadRequest("scope must not be empty".into())),
        Some(s) => Ok(s),
    }
}

/// `data` of a create response: the upstream job shape plus the local id.
#[derive(Debug, Serialize)]
pub struct JobData {
    pub id: String,
    #[serde(flatten)]
    pub job: TaskHandle,
}

impl JobData {
    fn from_task(task: &GenerationTask) -> Result<Self, ApiError> {
        let job = task.to_handle().ok_or_else(|| {
            ApiError::Task(tasks::TaskError::InvalidState(format!(
                "task {} has no upstream job",
                task.id
            )))
        })?;
        Ok(Self {
            id: task.id.clone(),
            job,
        })
    }
}

/// Start background polling for a freshly submitted task, if enabled.
fn watch(state: &AppState, id: &str) {
    if let Some(shutdown) = &state.watchers {
        // Dropping the handle detaches the loop; the shutdown token still reaches it.
        drop(state.orchestrator.watch_until(id, shutdown));
        debug!(id, "background polling started");
    }
}

fn submit_error(failure: SubmitFailure) -> ApiError {
    if let Some(task) = &failure.task {
        info!(id = %task.id, attempts = failure.attempts, "failed task kept for review");
    }
    ApiError::Task(failure.error)
}

#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub scope: Option<String>,
}

/// `POST /api/jobs`
#[instrument(skip_all, fields(route = "create_job"))]
pub async fn create_job(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
    body: Bytes,
) -> Response {
    let scope = RequestScope::start(&state, "create_job");
    let result = async {
        let payload: serde_json::Value = decode(&body)?;
        let scope_name = scope_or_default(&state, query.scope)?;
        let outcome = state
            .orchestrator
            .submit(&scope_name, SubmissionParams::new(payload))
            .await
            .map_err(submit_error)?;
        info!(
            request_id = %scope.request_id,
            id = %outcome.task.id,
            attempts = outcome.attempts,
            "job created"
        );
        watch(&state, &outcome.task.id);
        Ok::<_, ApiError>(success(&scope.request_id, JobData::from_task(&outcome.task)?))
    }
    .await;
    scope.finish(result)
}

/// `GET /api/jobs/{task_id}`
#[instrument(skip_all, fields(route = "get_job", task_id = %task_id))]
pub async fn get_job(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let scope = RequestScope::start(&state, "get_job");
    let result = state
        .orchestrator
        .status_by_task_id(&task_id, false)
        .await
        .map(|job| success(&scope.request_id, job))
        .map_err(ApiError::from);
    scope.finish(result)
}

/// Body of `POST /api/extensions`: the upstream extend request plus an
/// optional scope for the new local task.
#[derive(Debug, Deserialize)]
pub struct ExtendBody {
    pub video_id: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub options: ExtensionOptions,
}

/// `POST /api/extensions`
#[instrument(skip_all, fields(route = "create_extension"))]
pub async fn create_extension(State(state): State<AppState>, body: Bytes) -> Response {
    let scope = RequestScope::start(&state, "create_extension");
    let result = async {
        let request: ExtendBody = decode(&body)?;
        let fallback = scope_or_default(&state, request.scope)?;
        let outcome = state
            .orchestrator
            .extend_result(&request.video_id, request.options, &fallback)
            .await
            .map_err(submit_error)?;
        info!(
            request_id = %scope.request_id,
            id = %outcome.task.id,
            origin = %request.video_id,
            "extension created"
        );
        watch(&state, &outcome.task.id);
        Ok::<_, ApiError>(success(&scope.request_id, JobData::from_task(&outcome.task)?))
    }
    .await;
    scope.finish(result)
}

/// `GET /api/extensions/{task_id}`
#[instrument(skip_all, fields(route = "get_extension", task_id = %task_id))]
pub async fn get_extension(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let scope = RequestScope::start(&state, "get_extension");
    let result = state
        .orchestrator
        .status_by_task_id(&task_id, true)
        .await
        .map(|job| success(&scope.request_id, job))
        .map_err(ApiError::from);
    scope.finish(result)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "pageNum")]
    pub page_num: Option<u32>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<u32>,
}

/// `GET /api/extensions?pageNum&pageSize`
#[instrument(skip_all, fields(route = "list_extensions"))]
pub async fn list_extensions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let scope = RequestScope::start(&state, "list_extensions");
    let page = query.page_num.unwrap_or(1);
    let page_size = query
        .page_size
        .unwrap_or(state.orchestrator.config().page_size as u32);
    let result = state
        .orchestrator
        .list_extensions(page, page_size)
        .await
        .map(|jobs| success(&scope.request_id, jobs))
        .map_err(ApiError::from);
    scope.finish(result)
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ScopeView {
    pub scope: String,
    pub total: usize,
    pub pages_loaded: usize,
    pub exhausted: bool,
    pub tasks: Vec<GenerationTask>,
}

/// `GET /api/scopes/{scope}/tasks?page=N`: the scope's working set with at
/// least `N` pages loaded (or everything, if fewer exist).
#[instrument(skip_all, fields(route = "scope_tasks", scope = %scope_name))]
pub async fn scope_tasks(
    State(state): State<AppState>,
    Path(scope_name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    let scope = RequestScope::start(&state, "scope_tasks");
    let result = async {
        let wanted = query.page.unwrap_or(1);
        if wanted == 0 || wanted > MAX_PAGE {
            return Err(ApiError::BadRequest(format!(
                "page must be between 1 and {MAX_PAGE}"
            )));
        }
        let mut set = state.orchestrator.open_scope(&scope_name).await;
        while set.pages_loaded() < wanted && !set.is_exhausted() {
            set = state.orchestrator.load_more(&scope_name).await;
        }
        let view = ScopeView {
            scope: set.scope().to_string(),
            total: set.total(),
            pages_loaded: set.pages_loaded(),
            exhausted: set.is_exhausted(),
            tasks: set.tasks().to_vec(),
        };
        Ok::<_, ApiError>(success(&scope.request_id, view))
    }
    .await;
    scope.finish(result)
}

/// `DELETE /api/tasks/{id}`
#[instrument(skip_all, fields(route = "delete_task", id = %id))]
pub async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let scope = RequestScope::start(&state, "delete_task");
    let result = state
        .orchestrator
        .delete(&id)
        .await
        .map(|task| success(&scope.request_id, serde_json::json!({"id": task.id, "deleted": true})))
        .map_err(ApiError::from);
    scope.finish(result)
}

/// `GET /api/tasks/{id}/template`
#[instrument(skip_all, fields(route = "task_template", id = %id))]
pub async fn task_template(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let scope = RequestScope::start(&state, "task_template");
    let result = state
        .orchestrator
        .template(&id)
        .await
        .map(|params| success(&scope.request_id, params))
        .map_err(ApiError::from);
    scope.finish(result)
}
