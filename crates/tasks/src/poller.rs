//! Cancellable per-task poll loops
//!
//! Each watcher owns its own loop; nothing deduplicates watchers of the same
//! task. Cancellation is only observed between ticks, so a poll already in
//! flight completes and its result is applied (or discarded by the
//! absorbing terminal rule).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::model::GenerationTask;
use crate::orchestrator::Orchestrator;

/// Why a poll loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollExit {
    /// Task reached a terminal state
    Finished(GenerationTask),
    Cancelled,
    /// Polling cannot make progress (unknown task, never submitted)
    Stopped(TaskError),
}

pub struct PollHandle {
    cancel: CancellationToken,
    join: JoinHandle<PollExit>,
}

impl PollHandle {
    /// Stop after the current tick. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Token that cancels this loop, for tying it to another lifetime.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<PollExit, JoinError> {
        self.join.await
    }
}

/// Whether a poll error ends the loop rather than waiting for the next tick.
fn is_fatal(err: &TaskError) -> bool {
    matches!(
        err,
        TaskError::NotFound(_)
            | TaskError::InvalidState(_)
            | TaskError::Validation(_)
            | TaskError::ContentModeration(_)
    )
}

impl Orchestrator {
    /// Poll `id` at the configured interval until it is terminal.
    pub fn watch(self: &Arc<Self>, id: &str) -> PollHandle {
        self.watch_every(id, self.config().poll_interval)
    }

    pub fn watch_every(self: &Arc<Self>, id: &str, interval: Duration) -> PollHandle {
        self.spawn_watch(id, interval, CancellationToken::new())
    }

    /// Like [`watch`](Self::watch), but also stops when `parent` is cancelled.
    pub fn watch_until(self: &Arc<Self>, id: &str, parent: &CancellationToken) -> PollHandle {
        self.spawn_watch(id, self.config().poll_interval, parent.child_token())
    }

    fn spawn_watch(
        self: &Arc<Self>,
        id: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> PollHandle {
        let token = cancel.clone();
        let orchestrator = Arc::clone(self);
        let id = id.to_string();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(id = %id, "poll loop cancelled");
                        return PollExit::Cancelled;
                    }
                    _ = ticker.tick() => {}
                }

                match orchestrator.poll_once(&id).await {
                    Ok(task) if task.is_terminal() => {
                        debug!(id = %id, status = task.status.as_str(), "poll loop finished");
                        return PollExit::Finished(task);
                    }
                    Ok(_) => {}
                    Err(e) if is_fatal(&e) => {
                        warn!(id = %id, error = %e, "poll loop stopped");
                        return PollExit::Stopped(e);
                    }
                    Err(e) => {
                        warn!(id = %id, kind = e.kind().as_str(), error = %e, "poll failed, retrying next tick");
                    }
                }
            }
        });

        PollHandle { cancel, join }
    }
}
