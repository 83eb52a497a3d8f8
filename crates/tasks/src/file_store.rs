//! JSON file task store
//!
//! Holds every record in memory and rewrites the whole file on each change
//! using temp-file + rename, so a crash mid-write leaves the previous file
//! intact. A tokio Mutex serializes writers; poll loops for different tasks
//! save concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::GenerationTask;
use crate::store::{StoreError, StoreFuture, StoreResult, TaskStore, find_where, page_of};

pub struct FileTaskStore {
    path: PathBuf,
    state: Mutex<HashMap<String, GenerationTask>>,
}

impl FileTaskStore {
    /// Load records from `path`, creating an empty file on first start.
    pub async fn load(path: PathBuf) -> StoreResult<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::Io(format!("reading task file: {e}")))?;
            let records: HashMap<String, GenerationTask> = serde_json::from_str(&contents)
                .map_err(|e| StoreError::Serialization(format!("parsing task file: {e}")))?;
            info!(path = %path.display(), tasks = records.len(), "loaded task store");
            records
        } else {
            info!(path = %path.display(), "task file not found, starting with empty store");
            let records = HashMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TaskStore for FileTaskStore {
    fn save<'a>(&'a self, task: &'a GenerationTask) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(task.id.clone(), task.clone());
            debug!(id = %task.id, status = task.status.as_str(), "saved task");
            write_atomic(&self.path, &state).await
        })
    }

    fn delete_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(id).is_none() {
                return Ok(false);
            }
            debug!(id, "deleted task");
            write_atomic(&self.path, &state).await?;
            Ok(true)
        })
    }

    fn find_by_id<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<GenerationTask>> {
        Box::pin(async move { Ok(self.state.lock().await.get(id).cloned()) })
    }

    fn find_by_task_id<'a>(&'a self, task_id: &'a str) -> StoreFuture<'a, Option<GenerationTask>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(find_where(&state, |t| t.task_id.as_deref() == Some(task_id)))
        })
    }

    fn find_by_result_id<'a>(
        &'a self,
        result_id: &'a str,
    ) -> StoreFuture<'a, Option<GenerationTask>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(find_where(&state, |t| t.result_id.as_deref() == Some(result_id)))
        })
    }

    fn count_by_scope<'a>(&'a self, scope: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.values().filter(|t| t.scope == scope).count())
        })
    }

    fn page_by_scope<'a>(
        &'a self,
        scope: &'a str,
        page_number: usize,
        page_size: usize,
    ) -> StoreFuture<'a, Vec<GenerationTask>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(page_of(&state, scope, page_number, page_size))
        })
    }
}

async fn write_atomic(path: &Path, data: &HashMap<String, GenerationTask>) -> StoreResult<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| StoreError::Serialization(format!("serializing tasks: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io("task file path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".tasks.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StoreError::Io(format!("writing temp task file: {e}")))?;

    // Submission params may embed signed media URLs
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StoreError::Io(format!("setting task file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::Io(format!("renaming temp task file: {e}")))?;

    debug!(path = %path.display(), tasks = data.len(), "persisted tasks");
    Ok(())
}
