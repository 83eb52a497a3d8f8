//! Task orchestration: submission with credential rotation, polling,
//! extension, template reuse and per-scope working sets
//!
//! The orchestrator owns no timers. Polling is driven by callers through
//! `poll_once` or a `PollHandle` from `watch`. Store failures are logged and
//! swallowed; the working sets stay authoritative for the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use credential_pool::{CredentialPool, Exclusions};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use upstream::{ExtensionOptions, TaskHandle, Upstream, UpstreamError};
use upstream_auth::CredentialId;

use crate::error::{ErrorKind, Result, TaskError};
use crate::lifecycle::Transition;
use crate::model::{GenerationTask, SubmissionParams, TaskStatus, validate_extension};
use crate::store::TaskStore;
use crate::working_set::WorkingSet;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub page_size: usize,
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A submission upstream accepted.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub task: GenerationTask,
    /// Upstream submit calls made, including throttled ones
    pub attempts: usize,
    /// Credential that was accepted; `None` for extensions, which pick any
    pub credential_id: Option<CredentialId>,
}

/// A submission that did not produce a job.
///
/// `task` is the skeleton marked `Failed`, or `None` when the request was
/// rejected before a skeleton existed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct SubmitFailure {
    pub error: TaskError,
    pub task: Option<GenerationTask>,
    pub attempts: usize,
}

impl SubmitFailure {
    fn rejected(error: TaskError) -> Self {
        Self {
            error,
            task: None,
            attempts: 0,
        }
    }
}

pub struct Orchestrator {
    upstream: Arc<dyn Upstream>,
    pool: Arc<CredentialPool>,
    store: Arc<dyn TaskStore>,
    config: OrchestratorConfig,
    sets: RwLock<HashMap<String, WorkingSet>>,
    /// Held across re-read, apply and write-back of a poll result, and
    /// across delete, so a stale write never lands on top of a newer record.
    commits: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        pool: Arc<CredentialPool>,
        store: Arc<dyn TaskStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            upstream,
            pool,
            store,
            config,
            sets: RwLock::new(HashMap::new()),
            commits: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Submit a new generation job.
    ///
    /// Credentials are tried in random order; each one that throttles is
    /// excluded for the rest of this submission, so the loop makes at most
    /// `pool.len()` attempts. Any non-throttle failure ends it immediately.
    pub async fn submit(
        &self,
        scope: &str,
        params: SubmissionParams,
    ) -> std::result::Result<SubmitOutcome, SubmitFailure> {
        params.validate().map_err(SubmitFailure::rejected)?;

        let mut task = GenerationTask::skeleton(scope, params);
        self.track(&task).await;

        let mut excluded = Exclusions::new();
        let mut attempts = 0usize;
        let mut throttled: Option<(String, Option<u64>)> = None;

        let result = loop {
            let credential = match self.pool.acquire(&excluded) {
                Ok(credential) => credential,
                Err(e) => {
                    let (message, retry_after) =
                        throttled.take().unwrap_or_else(|| (e.to_string(), None));
                    break Err(TaskError::Exhausted {
                        attempts,
                        message,
                        retry_after,
                    });
                }
            };

            attempts += 1;
            match self
                .upstream
                .submit(credential, task.submission_params.as_value())
                .await
            {
                Ok(handle) => break Ok((handle, credential.id().to_string())),
                Err(UpstreamError::Throttle {
                    message,
                    retry_after,
                }) => {
                    warn!(
                        credential_id = credential.id(),
                        attempt = attempts,
                        retry_after = ?retry_after,
                        "credential throttled, rotating"
                    );
                    record_submission("throttled");
                    excluded.insert(credential.id().to_string());
                    // Earliest hint wins: that is when some credential frees up
                    let retry_after = match throttled.as_ref().and_then(|(_, r)| *r) {
                        Some(prev) => Some(retry_after.map_or(prev, |r| r.min(prev))),
                        None => retry_after,
                    };
                    throttled = Some((message, retry_after));
                }
                Err(other) => break Err(TaskError::from(other)),
            }
        };

        match result {
            Ok((handle, credential_id)) => {
                task.task_id = Some(handle.task_id.clone());
                task.apply_report(&handle);
                record_submission("accepted");
                info!(
                    id = %task.id,
                    task_id = %handle.task_id,
                    credential_id = %credential_id,
                    attempts,
                    "job submitted"
                );
                self.persist(&task).await;
                self.track(&task).await;
                Ok(SubmitOutcome {
                    task,
                    attempts,
                    credential_id: Some(credential_id),
                })
            }
            Err(error) => Err(self.fail_skeleton(task, error, attempts).await),
        }
    }

    /// Extend a succeeded task held by this orchestrator.
    pub async fn extend(
        &self,
        source_id: &str,
        options: ExtensionOptions,
    ) -> std::result::Result<SubmitOutcome, SubmitFailure> {
        let source = self
            .find(source_id)
            .await
            .ok_or_else(|| SubmitFailure::rejected(TaskError::NotFound(source_id.to_string())))?;
        let result_id = match (&source.status, &source.result_id) {
            (TaskStatus::Succeeded, Some(result_id)) => result_id.clone(),
            _ => {
                return Err(SubmitFailure::rejected(TaskError::InvalidState(format!(
                    "task {source_id} has no successful result to extend"
                ))));
            }
        };
        self.submit_extension(&source.scope, &result_id, options).await
    }

    /// Extend an upstream result by id. The new task joins the scope of the
    /// local task that produced `result_id`, or `fallback_scope` if unknown.
    pub async fn extend_result(
        &self,
        result_id: &str,
        options: ExtensionOptions,
        fallback_scope: &str,
    ) -> std::result::Result<SubmitOutcome, SubmitFailure> {
        let scope = match self.store.find_by_result_id(result_id).await {
            Ok(Some(source)) => source.scope,
            Ok(None) => fallback_scope.to_string(),
            Err(e) => {
                warn!(error = %e, result_id, "result lookup failed");
                fallback_scope.to_string()
            }
        };
        self.submit_extension(&scope, result_id, options).await
    }

    async fn submit_extension(
        &self,
        scope: &str,
        result_id: &str,
        options: ExtensionOptions,
    ) -> std::result::Result<SubmitOutcome, SubmitFailure> {
        validate_extension(&options).map_err(SubmitFailure::rejected)?;
        if result_id.trim().is_empty() {
            return Err(SubmitFailure::rejected(TaskError::Validation(
                "video_id is required".into(),
            )));
        }

        let mut task = GenerationTask::extension_skeleton(scope, result_id, &options);
        self.track(&task).await;

        match self.upstream.submit_extension(result_id, &options).await {
            Ok(handle) => {
                task.task_id = Some(handle.task_id.clone());
                task.apply_report(&handle);
                record_submission("accepted");
                info!(id = %task.id, task_id = %handle.task_id, origin = result_id, "extension submitted");
                self.persist(&task).await;
                self.track(&task).await;
                Ok(SubmitOutcome {
                    task,
                    attempts: 1,
                    credential_id: None,
                })
            }
            Err(e) => Err(self.fail_skeleton(task, e.into(), 1).await),
        }
    }

    /// Keep the skeleton, marked failed, so the caller sees why.
    async fn fail_skeleton(
        &self,
        mut task: GenerationTask,
        error: TaskError,
        attempts: usize,
    ) -> SubmitFailure {
        record_submission(outcome_label(&error));
        warn!(id = %task.id, attempts, kind = error.kind().as_str(), error = %error, "submission failed");
        task.mark_failed(error.to_string(), error.kind());
        self.persist(&task).await;
        self.track(&task).await;
        SubmitFailure {
            error,
            task: Some(task),
            attempts,
        }
    }

    /// Poll upstream once for a task and apply the report.
    ///
    /// Terminal tasks are returned as-is without an upstream call. Every
    /// other poll is persisted, including ones that change nothing but
    /// `updated_at`.
    pub async fn poll_once(&self, id: &str) -> Result<GenerationTask> {
        let task = self
            .find(id)
            .await
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.is_terminal() {
            return Ok(task);
        }
        let task_id = task
            .task_id
            .clone()
            .ok_or_else(|| TaskError::InvalidState(format!("task {id} was never submitted")))?;

        let report = if task.is_extension {
            self.upstream.fetch_extension(&task_id).await
        } else {
            self.upstream.fetch_status(&task_id).await
        }?;
        metrics::counter!("task_polls_total", "status" => report.task_status.as_str())
            .increment(1);

        // Re-read under the commit lock: another watcher may have finished
        // or deleted the task while this report was in flight
        let _commit = self.commits.lock().await;
        let Some(mut latest) = self.find(id).await else {
            debug!(id, task_id = %task_id, "task deleted while polling, report discarded");
            return Err(TaskError::NotFound(id.to_string()));
        };
        let transition = latest.apply_report(&report);
        if transition == Transition::Ignored {
            debug!(id, task_id = %task_id, "late report for terminal task discarded");
            return Ok(latest);
        }
        if transition.is_terminal() {
            info!(id, task_id = %task_id, status = latest.status.as_str(), "task finished");
        } else {
            debug!(id, task_id = %task_id, status = latest.status.as_str(), "task polled");
        }
        self.persist(&latest).await;
        self.track(&latest).await;
        Ok(latest)
    }

    /// Status of an upstream job by its upstream id.
    ///
    /// Known non-terminal tasks are polled and their record updated; known
    /// terminal tasks are answered locally; unknown ids pass straight
    /// through to upstream.
    pub async fn status_by_task_id(&self, task_id: &str, extension: bool) -> Result<TaskHandle> {
        if let Some(task) = self.find_by_task_id(task_id).await {
            let task = self.poll_once(&task.id).await?;
            if let Some(handle) = task.to_handle() {
                return Ok(handle);
            }
        }
        let handle = if extension {
            self.upstream.fetch_extension(task_id).await?
        } else {
            self.upstream.fetch_status(task_id).await?
        };
        Ok(handle)
    }

    /// One page of upstream extension jobs.
    pub async fn list_extensions(&self, page: u32, page_size: u32) -> Result<Vec<TaskHandle>> {
        if page == 0 || page_size == 0 {
            return Err(TaskError::Validation(
                "pageNum and pageSize must be positive".into(),
            ));
        }
        Ok(self.upstream.list_extensions(page, page_size).await?)
    }

    /// Submission params of a task, stripped of runtime state, for reuse.
    pub async fn template(&self, id: &str) -> Result<SubmissionParams> {
        let task = self
            .find(id)
            .await
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        Ok(task.submission_params.template())
    }

    /// Forget a task locally. Upstream jobs are never cancelled.
    pub async fn delete(&self, id: &str) -> Result<GenerationTask> {
        let _commit = self.commits.lock().await;
        let in_memory = {
            let mut sets = self.sets.write().await;
            sets.values_mut().find_map(|set| set.remove(id))
        };
        let stored = match self.store.find_by_id(id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, id, "task lookup failed during delete");
                None
            }
        };
        let removed = in_memory
            .or(stored)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if let Err(e) = self.store.delete_by_id(id).await {
            warn!(error = %e, id, "failed to delete task from store");
        }
        info!(id, scope = %removed.scope, "task deleted");
        Ok(removed)
    }

    /// Start (or return) the session view of a scope: cached count plus
    /// the first page.
    pub async fn open_scope(&self, scope: &str) -> WorkingSet {
        if let Some(set) = self.sets.read().await.get(scope) {
            return set.clone();
        }

        let total = match self.store.count_by_scope(scope).await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, scope, "count failed, treating scope as empty");
                0
            }
        };
        let first = self.fetch_page(scope, 1).await;

        let mut sets = self.sets.write().await;
        let set = sets
            .entry(scope.to_string())
            .or_insert_with(|| WorkingSet::open(scope, self.config.page_size, total, first));
        set.clone()
    }

    /// Append the next page of a scope. No-op once exhausted.
    pub async fn load_more(&self, scope: &str) -> WorkingSet {
        let current = self.open_scope(scope).await;
        if current.is_exhausted() {
            return current;
        }
        let page_number = current.next_page();
        let page = self.fetch_page(scope, page_number).await;

        let mut sets = self.sets.write().await;
        match sets.get_mut(scope) {
            // Another caller loaded this page first
            Some(set) if set.next_page() != page_number => set.clone(),
            Some(set) => {
                let added = set.merge_page(page);
                debug!(scope, page = page_number, added, exhausted = set.is_exhausted(), "loaded page");
                set.clone()
            }
            None => current,
        }
    }

    /// Snapshot of a scope's working set, if opened.
    pub async fn working_set(&self, scope: &str) -> Option<WorkingSet> {
        self.sets.read().await.get(scope).cloned()
    }

    /// Look a task up in memory first, then in the store.
    pub async fn find(&self, id: &str) -> Option<GenerationTask> {
        {
            let sets = self.sets.read().await;
            if let Some(task) = sets.values().find_map(|set| set.get(id)) {
                return Some(task.clone());
            }
        }
        match self.store.find_by_id(id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, id, "task lookup failed");
                None
            }
        }
    }

    pub async fn find_by_task_id(&self, task_id: &str) -> Option<GenerationTask> {
        {
            let sets = self.sets.read().await;
            let found = sets.values().find_map(|set| {
                set.tasks()
                    .iter()
                    .find(|t| t.task_id.as_deref() == Some(task_id))
            });
            if let Some(task) = found {
                return Some(task.clone());
            }
        }
        match self.store.find_by_task_id(task_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, task_id, "task lookup failed");
                None
            }
        }
    }

    async fn fetch_page(&self, scope: &str, page_number: usize) -> Vec<GenerationTask> {
        match self
            .store
            .page_by_scope(scope, page_number, self.config.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, scope, page = page_number, "page load failed");
                Vec::new()
            }
        }
    }

    /// Reflect a task in its scope's working set, if that scope is open.
    async fn track(&self, task: &GenerationTask) {
        let mut sets = self.sets.write().await;
        if let Some(set) = sets.get_mut(&task.scope)
            && !set.replace(task)
        {
            set.prepend(task.clone());
        }
    }

    async fn persist(&self, task: &GenerationTask) {
        if let Err(e) = self.store.save(task).await {
            warn!(
                id = %task.id,
                kind = ErrorKind::Persistence.as_str(),
                error = %e,
                "failed to persist task"
            );
        }
    }
}

fn record_submission(outcome: &'static str) {
    metrics::counter!("upstream_submissions_total", "outcome" => outcome).increment(1);
}

fn outcome_label(error: &TaskError) -> &'static str {
    match error {
        TaskError::Exhausted { .. } => "exhausted",
        TaskError::Throttle { .. } => "throttled",
        TaskError::ContentModeration(_) => "moderated",
        _ => "failed",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{MemoryTaskStore, StoreError, StoreFuture};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use upstream::{TaskResult, UpstreamFuture, UpstreamStatus, Video};
    use upstream_auth::Credential;

    /// Scripted upstream: per-credential submit responses and a queue of
    /// status reports.
    #[derive(Default)]
    pub(crate) struct FakeUpstream {
        pub throttled: Vec<String>,
        pub moderated: bool,
        pub submits: Mutex<Vec<String>>,
        pub reports: Mutex<VecDeque<upstream::Result<TaskHandle>>>,
        pub polls: AtomicUsize,
        pub extension_requests: Mutex<Vec<(String, ExtensionOptions)>>,
        /// Per-poll latency, consumed in order; polls beyond it answer at once
        pub latencies: Mutex<VecDeque<Duration>>,
    }

    pub(crate) fn handle(task_id: &str, status: UpstreamStatus) -> TaskHandle {
        TaskHandle {
            task_id: task_id.into(),
            task_status: status,
            task_status_msg: None,
            task_result: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    pub(crate) fn succeeded(task_id: &str, video_id: &str) -> TaskHandle {
        TaskHandle {
            task_result: Some(TaskResult {
                videos: vec![Video {
                    id: video_id.into(),
                    url: format!("https://cdn/{video_id}.mp4"),
                    duration: None,
                }],
            }),
            ..handle(task_id, UpstreamStatus::Succeed)
        }
    }

    impl FakeUpstream {
        pub(crate) fn with_reports(reports: Vec<TaskHandle>) -> Self {
            Self {
                reports: Mutex::new(reports.into_iter().map(Ok).collect()),
                ..Default::default()
            }
        }

        fn next_report(&self, task_id: &str) -> upstream::Result<TaskHandle> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.reports
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(handle(task_id, UpstreamStatus::Processing)))
        }
    }

    impl Upstream for FakeUpstream {
        fn submit<'a>(
            &'a self,
            credential: &'a Credential,
            _payload: &'a serde_json::Value,
        ) -> UpstreamFuture<'a, TaskHandle> {
            Box::pin(async move {
                self.submits.lock().unwrap().push(credential.id().to_string());
                if self.moderated {
                    return Err(UpstreamError::ContentModeration {
                        message: "prompt failed content security".into(),
                    });
                }
                if self.throttled.iter().any(|id| id == credential.id()) {
                    return Err(UpstreamError::Throttle {
                        message: format!("{} over parallel task limit", credential.id()),
                        retry_after: Some(30),
                    });
                }
                Ok(handle(&format!("t-{}", credential.id()), UpstreamStatus::Submitted))
            })
        }

        fn fetch_status<'a>(&'a self, task_id: &'a str) -> UpstreamFuture<'a, TaskHandle> {
            // Reports are taken in call order; latency only delays the answer
            let report = self.next_report(task_id);
            let latency = self.latencies.lock().unwrap().pop_front();
            Box::pin(async move {
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                report
            })
        }

        fn submit_extension<'a>(
            &'a self,
            result_id: &'a str,
            options: &'a ExtensionOptions,
        ) -> UpstreamFuture<'a, TaskHandle> {
            Box::pin(async move {
                self.extension_requests
                    .lock()
                    .unwrap()
                    .push((result_id.to_string(), options.clone()));
                Ok(handle("ext-1", UpstreamStatus::Submitted))
            })
        }

        fn fetch_extension<'a>(&'a self, task_id: &'a str) -> UpstreamFuture<'a, TaskHandle> {
            Box::pin(async move { self.next_report(task_id) })
        }

        fn list_extensions(&self, page: u32, _page_size: u32) -> UpstreamFuture<'_, Vec<TaskHandle>> {
            Box::pin(async move { Ok(vec![handle(&format!("ext-page-{page}"), UpstreamStatus::Processing)]) })
        }
    }

    /// Store wrapper counting writes, optionally failing them.
    #[derive(Default)]
    pub(crate) struct CountingStore {
        pub inner: MemoryTaskStore,
        pub saves: AtomicUsize,
        pub fail_writes: bool,
        /// Delay applied to saves of non-terminal records
        pub slow_pending_saves: Option<Duration>,
    }

    impl TaskStore for CountingStore {
        fn save<'a>(&'a self, task: &'a GenerationTask) -> StoreFuture<'a, ()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes {
                return Box::pin(async { Err(StoreError::Io("disk full".into())) });
            }
            match self.slow_pending_saves {
                Some(delay) if !task.is_terminal() => Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    self.inner.save(task).await
                }),
                _ => self.inner.save(task),
            }
        }
        fn delete_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
            if self.fail_writes {
                return Box::pin(async { Err(StoreError::Io("disk full".into())) });
            }
            self.inner.delete_by_id(id)
        }
        fn find_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<GenerationTask>> {
            self.inner.find_by_id(id)
        }
        fn find_by_task_id<'a>(
            &'a self,
            task_id: &'a str,
        ) -> StoreFuture<'a, Option<GenerationTask>> {
            self.inner.find_by_task_id(task_id)
        }
        fn find_by_result_id<'a>(
            &'a self,
            result_id: &'a str,
        ) -> StoreFuture<'a, Option<GenerationTask>> {
            self.inner.find_by_result_id(result_id)
        }
        fn count_by_scope<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, usize> {
            self.inner.count_by_scope(scope)
        }
        fn page_by_scope<'a>(
            &'a self,
            scope: &'a str,
            page_number: usize,
            page_size: usize,
        ) -> StoreFuture<'a, Vec<GenerationTask>> {
            self.inner.page_by_scope(scope, page_number, page_size)
        }
    }

    pub(crate) fn pool(ids: &[&str]) -> Arc<CredentialPool> {
        let credentials = ids
            .iter()
            .map(|id| Credential::new(*id, format!("{id}-secret")).unwrap())
            .collect();
        Arc::new(CredentialPool::new(credentials).unwrap())
    }

    pub(crate) fn orchestrator(
        upstream: Arc<FakeUpstream>,
        pool: Arc<CredentialPool>,
        store: Arc<CountingStore>,
    ) -> Orchestrator {
        Orchestrator::new(upstream, pool, store, OrchestratorConfig::default())
    }

    fn prompt() -> SubmissionParams {
        SubmissionParams::new(serde_json::json!({"prompt": "a fox in snow", "duration": "5"}))
    }

    /// A submitted task saved straight into the store.
    async fn submitted_task(store: &CountingStore, is_extension: bool) -> GenerationTask {
        let mut task = GenerationTask::skeleton("ws", prompt());
        task.task_id = Some("t-1".into());
        task.is_extension = is_extension;
        store.inner.save(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn throttled_credential_rotates_to_next() {
        let upstream = Arc::new(FakeUpstream {
            throttled: vec!["A".into()],
            ..Default::default()
        });
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(upstream.clone(), pool(&["A", "B"]), store.clone());

        // Random selection may pick B first; repeat until A is tried first
        for _ in 0..64 {
            upstream.submits.lock().unwrap().clear();
            let outcome = orch.submit("ws", prompt()).await.unwrap();
            assert_eq!(outcome.credential_id.as_deref(), Some("B"));
            assert_eq!(outcome.task.task_id.as_deref(), Some("t-B"));
            assert_eq!(outcome.task.status, TaskStatus::Pending);
            let tried = upstream.submits.lock().unwrap().clone();
            assert_eq!(outcome.attempts, tried.len());
            if tried == ["A", "B"] {
                assert_eq!(outcome.attempts, 2);
                return;
            }
            assert_eq!(tried, ["B"]);
        }
        panic!("credential A was never selected first");
    }

    #[tokio::test]
    async fn single_throttled_credential_exhausts_after_one_attempt() {
        let upstream = Arc::new(FakeUpstream {
            throttled: vec!["A".into()],
            ..Default::default()
        });
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(upstream.clone(), pool(&["A"]), store.clone());

        let failure = orch.submit("ws", prompt()).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(upstream.submits.lock().unwrap().len(), 1);
        assert!(matches!(
            failure.error,
            TaskError::Exhausted {
                attempts: 1,
                retry_after: Some(30),
                ..
            }
        ));
        assert_eq!(failure.error.kind(), ErrorKind::Throttle);

        let task = failure.task.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_kind, Some(ErrorKind::Throttle));
        assert!(task.task_id.is_none());
        assert!(store.inner.find_by_id(&task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn every_credential_tried_at_most_once() {
        let ids = ["A", "B", "C", "D", "E"];
        let upstream = Arc::new(FakeUpstream {
            throttled: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
        let orch = orchestrator(upstream.clone(), pool(&ids), Arc::new(CountingStore::default()));

        let failure = orch.submit("ws", prompt()).await.unwrap_err();
        assert_eq!(failure.attempts, ids.len());
        let mut tried = upstream.submits.lock().unwrap().clone();
        tried.sort();
        assert_eq!(tried, ids);
    }

    #[tokio::test]
    async fn empty_pool_fails_without_attempts() {
        let upstream = Arc::new(FakeUpstream::default());
        let orch = orchestrator(upstream.clone(), pool(&[]), Arc::new(CountingStore::default()));

        let failure = orch.submit("ws", prompt()).await.unwrap_err();
        assert_eq!(failure.attempts, 0);
        assert!(matches!(failure.error, TaskError::Exhausted { attempts: 0, .. }));
        assert!(upstream.submits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn moderation_stops_rotation() {
        let upstream = Arc::new(FakeUpstream {
            moderated: true,
            ..Default::default()
        });
        let orch = orchestrator(upstream.clone(), pool(&["A", "B"]), Arc::new(CountingStore::default()));

        let failure = orch.submit("ws", prompt()).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error.kind(), ErrorKind::ContentModeration);
        assert_eq!(
            failure.task.unwrap().error_kind,
            Some(ErrorKind::ContentModeration)
        );
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_upstream() {
        let upstream = Arc::new(FakeUpstream::default());
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(upstream.clone(), pool(&["A"]), store.clone());
        orch.open_scope("ws").await;

        let failure = orch
            .submit("ws", SubmissionParams::new(serde_json::json!({"duration": "5"})))
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::Validation);
        assert!(failure.task.is_none());
        assert!(upstream.submits.lock().unwrap().is_empty());
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert!(orch.working_set("ws").await.unwrap().tasks().is_empty());
    }

    #[tokio::test]
    async fn poll_sequence_persists_every_poll() {
        let upstream = Arc::new(FakeUpstream::with_reports(vec![
            handle("t-1", UpstreamStatus::Processing),
            handle("t-1", UpstreamStatus::Processing),
            succeeded("t-1", "v-1"),
        ]));
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(upstream.clone(), pool(&["A"]), store.clone());
        let task = submitted_task(&store, false).await;

        for _ in 0..3 {
            orch.poll_once(&task.id).await.unwrap();
        }

        assert_eq!(store.saves.load(Ordering::SeqCst), 3);
        let persisted = store.inner.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, TaskStatus::Succeeded);
        assert_eq!(persisted.result_urls, vec!["https://cdn/v-1.mp4".to_string()]);
        assert_eq!(persisted.result_id.as_deref(), Some("v-1"));
    }

    #[tokio::test]
    async fn terminal_task_is_not_polled_again() {
        let upstream = Arc::new(FakeUpstream::with_reports(vec![
            succeeded("t-1", "v-1"),
            handle("t-1", UpstreamStatus::Failed),
        ]));
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(upstream.clone(), pool(&["A"]), store.clone());
        let task = submitted_task(&store, false).await;

        let done = orch.poll_once(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        let again = orch.poll_once(&task.id).await.unwrap();
        assert_eq!(again.status, TaskStatus::Succeeded);
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubmitted_task_cannot_be_polled() {
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(Arc::new(FakeUpstream::default()), pool(&["A"]), store.clone());
        let task = GenerationTask::skeleton("ws", prompt());
        store.inner.save(&task).await.unwrap();

        let err = orch.poll_once(&task.id).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidState(_)));
        assert!(matches!(
            orch.poll_once("missing").await.unwrap_err(),
            TaskError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn extension_tasks_poll_the_extension_endpoint() {
        let upstream = Arc::new(FakeUpstream::with_reports(vec![succeeded("t-1", "v-2")]));
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(upstream.clone(), pool(&["A"]), store.clone());
        let task = submitted_task(&store, true).await;

        let done = orch.poll_once(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn extend_links_new_task_to_source_result() {
        let upstream = Arc::new(FakeUpstream::with_reports(vec![succeeded("t-A", "v-1")]));
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(upstream.clone(), pool(&["A"]), store.clone());

        let source = orch.submit("ws", prompt()).await.unwrap().task;
        let source = orch.poll_once(&source.id).await.unwrap();
        assert_eq!(source.result_id.as_deref(), Some("v-1"));

        let options = ExtensionOptions {
            prompt: Some("keep going".into()),
            ..Default::default()
        };
        let outcome = orch.extend(&source.id, options.clone()).await.unwrap();
        let extension = outcome.task;
        assert!(extension.is_extension);
        assert_eq!(extension.origin, source.result_id);
        assert_eq!(extension.scope, "ws");
        assert_eq!(extension.task_id.as_deref(), Some("ext-1"));
        assert_eq!(
            upstream.extension_requests.lock().unwrap().as_slice(),
            &[("v-1".to_string(), options)]
        );
    }

    #[tokio::test]
    async fn extend_requires_successful_source() {
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(Arc::new(FakeUpstream::default()), pool(&["A"]), store.clone());
        let pending = submitted_task(&store, false).await;

        let failure = orch.extend(&pending.id, ExtensionOptions::default()).await.unwrap_err();
        assert!(matches!(failure.error, TaskError::InvalidState(_)));
        assert!(failure.task.is_none());
    }

    #[tokio::test]
    async fn extend_result_uses_source_scope() {
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(Arc::new(FakeUpstream::default()), pool(&["A"]), store.clone());
        let mut source = GenerationTask::skeleton("project-7", prompt());
        source.result_id = Some("v-7".into());
        store.inner.save(&source).await.unwrap();

        let known = orch
            .extend_result("v-7", ExtensionOptions::default(), "default")
            .await
            .unwrap();
        assert_eq!(known.task.scope, "project-7");

        let unknown = orch
            .extend_result("v-elsewhere", ExtensionOptions::default(), "default")
            .await
            .unwrap();
        assert_eq!(unknown.task.scope, "default");
        assert_eq!(unknown.task.origin.as_deref(), Some("v-elsewhere"));
    }

    #[tokio::test]
    async fn template_strips_identity() {
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(
            Arc::new(FakeUpstream::with_reports(vec![succeeded("t-A", "v-1")])),
            pool(&["A"]),
            store.clone(),
        );
        let task = orch.submit("ws", prompt()).await.unwrap().task;
        orch.poll_once(&task.id).await.unwrap();

        let template = orch.template(&task.id).await.unwrap();
        assert_eq!(template, prompt());
        let reused = orch.submit("ws", template).await.unwrap().task;
        assert_ne!(reused.id, task.id);
        assert_eq!(reused.status, TaskStatus::Pending);
        assert!(reused.result_urls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_polls_never_regress_a_finished_task() {
        let upstream = Arc::new(FakeUpstream {
            latencies: Mutex::new(
                vec![Duration::from_millis(10), Duration::from_millis(20)].into(),
            ),
            ..FakeUpstream::with_reports(vec![
                handle("t-1", UpstreamStatus::Processing),
                succeeded("t-1", "v-1"),
            ])
        });
        let store = Arc::new(CountingStore {
            slow_pending_saves: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let orch = orchestrator(upstream.clone(), pool(&["A"]), store.clone());
        let task = submitted_task(&store, false).await;
        orch.open_scope("ws").await;

        let (first, second) = tokio::join!(orch.poll_once(&task.id), orch.poll_once(&task.id));
        let statuses = [first.unwrap().status, second.unwrap().status];
        assert!(statuses.contains(&TaskStatus::Succeeded), "{statuses:?}");

        let persisted = store.inner.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, TaskStatus::Succeeded);
        let in_memory = orch.working_set("ws").await.unwrap();
        assert_eq!(in_memory.get(&task.id).unwrap().status, TaskStatus::Succeeded);
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn poll_after_delete_does_not_resurrect_the_task() {
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(Arc::new(FakeUpstream::default()), pool(&["A"]), store.clone());
        let task = submitted_task(&store, false).await;
        orch.delete(&task.id).await.unwrap();

        assert!(matches!(orch.poll_once(&task.id).await, Err(TaskError::NotFound(_))));
        assert!(store.inner.find_by_id(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistence_failures_do_not_interrupt_the_flow() {
        let store = Arc::new(CountingStore {
            fail_writes: true,
            ..Default::default()
        });
        let upstream = Arc::new(FakeUpstream::with_reports(vec![succeeded("t-A", "v-1")]));
        let orch = orchestrator(upstream, pool(&["A"]), store.clone());
        orch.open_scope("ws").await;

        let task = orch.submit("ws", prompt()).await.unwrap().task;
        let done = orch.poll_once(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert!(store.saves.load(Ordering::SeqCst) >= 2);
        assert!(store.inner.is_empty().await);

        let deleted = orch.delete(&task.id).await.unwrap();
        assert_eq!(deleted.id, task.id);
    }

    #[tokio::test]
    async fn submissions_are_prepended_to_open_scope() {
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(Arc::new(FakeUpstream::default()), pool(&["A"]), store.clone());
        for task in crate::store::tests::seeded_tasks("ws", 3) {
            store.inner.save(&task).await.unwrap();
        }

        let opened = orch.open_scope("ws").await;
        assert_eq!(opened.total(), 3);

        let task = orch.submit("ws", prompt()).await.unwrap().task;
        let set = orch.working_set("ws").await.unwrap();
        assert_eq!(set.total(), 4);
        assert_eq!(set.tasks()[0].id, task.id);
        assert_eq!(set.tasks()[0].task_id.as_deref(), Some("t-A"));
        assert_eq!(set.tasks().len(), 4);
    }

    #[tokio::test]
    async fn load_more_pages_through_scope() {
        let store = Arc::new(CountingStore::default());
        let orch = Orchestrator::new(
            Arc::new(FakeUpstream::default()),
            pool(&["A"]),
            store.clone(),
            OrchestratorConfig {
                page_size: 2,
                ..Default::default()
            },
        );
        for task in crate::store::tests::seeded_tasks("ws", 5) {
            store.inner.save(&task).await.unwrap();
        }

        let mut set = orch.open_scope("ws").await;
        assert_eq!(set.tasks().len(), 2);
        while !set.is_exhausted() {
            set = orch.load_more("ws").await;
        }
        assert_eq!(set.tasks().len(), 5);
        assert_eq!(set.pages_loaded(), 3);
    }

    #[tokio::test]
    async fn delete_removes_from_memory_and_store() {
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(Arc::new(FakeUpstream::default()), pool(&["A"]), store.clone());
        orch.open_scope("ws").await;
        let task = orch.submit("ws", prompt()).await.unwrap().task;

        orch.delete(&task.id).await.unwrap();
        assert!(orch.find(&task.id).await.is_none());
        assert_eq!(orch.working_set("ws").await.unwrap().total(), 0);
        assert!(matches!(
            orch.delete(&task.id).await.unwrap_err(),
            TaskError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn status_by_task_id_updates_known_tasks_and_passes_through_unknown() {
        let upstream = Arc::new(FakeUpstream::with_reports(vec![
            succeeded("t-1", "v-1"),
            handle("t-other", UpstreamStatus::Processing),
        ]));
        let store = Arc::new(CountingStore::default());
        let orch = orchestrator(upstream.clone(), pool(&["A"]), store.clone());
        let task = submitted_task(&store, false).await;

        let known = orch.status_by_task_id("t-1", false).await.unwrap();
        assert_eq!(known.task_status, UpstreamStatus::Succeed);
        assert_eq!(known.videos()[0].id, "v-1");
        assert_eq!(
            store.inner.find_by_id(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Succeeded
        );

        let unknown = orch.status_by_task_id("t-other", false).await.unwrap();
        assert_eq!(unknown.task_id, "t-other");
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn list_extensions_rejects_zero_page() {
        let orch = orchestrator(
            Arc::new(FakeUpstream::default()),
            pool(&["A"]),
            Arc::new(CountingStore::default()),
        );
        assert!(orch.list_extensions(0, 10).await.is_err());
        let page = orch.list_extensions(2, 10).await.unwrap();
        assert_eq!(page[0].task_id, "ext-page-2");
    }
}
