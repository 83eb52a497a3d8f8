//! Task persistence contract
//!
//! The orchestrator only talks to `dyn TaskStore`. Records are keyed by the
//! client-local `id`; `task_id` and `result_id` are secondary lookups. Pages
//! are per scope, most recent first.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use crate::model::GenerationTask;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Boxed future returned by `TaskStore` methods, for `Arc<dyn TaskStore>`.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

pub trait TaskStore: Send + Sync {
    /// Insert or replace the record with this task's `id`.
    fn save<'a>(&'a self, task: &'a GenerationTask) -> StoreFuture<'a, ()>;

    /// Remove a record. Returns whether it existed.
    fn delete_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool>;

    fn find_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<GenerationTask>>;

    fn find_by_task_id<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, Option<GenerationTask>>;

    fn find_by_result_id<'a>(
        &'a self,
        result_id: &'a str,
    ) -> StoreFuture<'a, Option<GenerationTask>>;

    fn count_by_scope<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, usize>;

    /// One page (1-based) of a scope's tasks, newest first.
    fn page_by_scope<'a>(
        &'a self,
        scope: &'a str,
        page_number: usize,
        page_size: usize,
    ) -> StoreFuture<'a, Vec<GenerationTask>>;
}

/// Newest first; equal timestamps fall back to `id` so pages never overlap.
pub(crate) fn sort_recent_first(tasks: &mut [GenerationTask]) {
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Slice out one page of a scope from an unordered record map.
pub(crate) fn page_of(
    records: &HashMap<String, GenerationTask>,
    scope: &str,
    page_number: usize,
    page_size: usize,
) -> Vec<GenerationTask> {
    if page_number == 0 || page_size == 0 {
        return Vec::new();
    }
    let mut scoped: Vec<GenerationTask> = records
        .values()
        .filter(|t| t.scope == scope)
        .cloned()
        .collect();
    sort_recent_first(&mut scoped);
    scoped
        .into_iter()
        .skip((page_number - 1).saturating_mul(page_size))
        .take(page_size)
        .collect()
}

pub(crate) fn find_where(
    records: &HashMap<String, GenerationTask>,
    pred: impl Fn(&GenerationTask) -> bool,
) -> Option<GenerationTask> {
    records.values().find(|t| pred(t)).cloned()
}

/// Ephemeral store for tests and `store.kind = "memory"`.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<String, GenerationTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TaskStore for MemoryTaskStore {
    fn save<'a>(&'a self, task: &'a GenerationTask) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.records
                .write()
                .await
                .insert(task.id.clone(), task.clone());
            Ok(())
        })
    }

    fn delete_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.records.write().await.remove(id).is_some()) })
    }

    fn find_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<GenerationTask>> {
        Box::pin(async move { Ok(self.records.read().await.get(id).cloned()) })
    }

    fn find_by_task_id<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, Option<GenerationTask>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(find_where(&records, |t| t.task_id.as_deref() == Some(task_id)))
        })
    }

    fn find_by_result_id<'a>(
        &'a self,
        result_id: &'a str,
    ) -> StoreFuture<'a, Option<GenerationTask>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(find_where(&records, |t| t.result_id.as_deref() == Some(result_id)))
        })
    }

    fn count_by_scope<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(records.values().filter(|t| t.scope == scope).count())
        })
    }

    fn page_by_scope<'a>(
        &'a self,
        scope: &'a str,
        page_number: usize,
        page_size: usize,
    ) -> StoreFuture<'a, Vec<GenerationTask>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(page_of(&records, scope, page_number, page_size))
        })
    }
}
