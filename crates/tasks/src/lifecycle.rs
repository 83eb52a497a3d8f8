//! Status transitions as a pure function
//!
//! `apply` decides what a poll report means for a task in a given state and
//! `GenerationTask::commit` writes that decision into the record. Keeping
//! the decision pure means the absorbing-terminal rule is tested without an
//! upstream, a store, or a timer.

use chrono::Utc;
use upstream::{TaskHandle, UpstreamStatus};

use crate::error::ErrorKind;
use crate::model::{GenerationTask, TaskStatus};

pub const EMPTY_SUCCESS_MESSAGE: &str = "upstream reported success without results";
pub const DEFAULT_FAILURE_MESSAGE: &str = "generation failed";

/// Outcome of applying one upstream report to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Still in flight at the same (or a later-reported earlier) status
    Unchanged,
    /// Moved forward without finishing
    Advanced(TaskStatus),
    Succeeded {
        result_id: Option<String>,
        urls: Vec<String>,
    },
    Failed {
        message: String,
    },
    /// Task was already terminal; the report is discarded
    Ignored,
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Transition::Succeeded { .. } | Transition::Failed { .. })
    }
}

/// Decide the transition for `current` given an upstream `report`.
///
/// Terminal states are absorbing. Non-terminal statuses only move forward:
/// a late `submitted` after `processing` leaves the task where it is.
pub fn apply(current: TaskStatus, report: &TaskHandle) -> Transition {
    if current.is_terminal() {
        return Transition::Ignored;
    }

    match report.task_status {
        UpstreamStatus::Succeed => {
            let urls: Vec<String> = report
                .videos()
                .iter()
                .map(|v| v.url.clone())
                .filter(|url| !url.is_empty())
                .collect();
            if urls.is_empty() {
                return Transition::Failed {
                    message: EMPTY_SUCCESS_MESSAGE.to_string(),
                };
            }
            Transition::Succeeded {
                result_id: report.videos().first().map(|v| v.id.clone()),
                urls,
            }
        }
        UpstreamStatus::Failed => Transition::Failed {
            message: report
                .task_status_msg
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
        },
        status => {
            let next = TaskStatus::from(status);
            if next.rank() > current.rank() {
                Transition::Advanced(next)
            } else {
                Transition::Unchanged
            }
        }
    }
}

impl GenerationTask {
    /// Apply a report and write the result into this record.
    pub fn apply_report(&mut self, report: &TaskHandle) -> Transition {
        let transition = apply(self.status, report);
        self.commit(&transition);
        transition
    }

    /// Write a transition into the record. Returns false for `Ignored`.
    pub fn commit(&mut self, transition: &Transition) -> bool {
        match transition {
            Transition::Ignored => return false,
            Transition::Unchanged => {}
            Transition::Advanced(status) => self.status = *status,
            Transition::Succeeded { result_id, urls } => {
                self.status = TaskStatus::Succeeded;
                self.result_id = result_id.clone();
                self.result_urls = urls.clone();
                self.error_message = None;
                self.error_kind = None;
            }
            Transition::Failed { message } => {
                self.status = TaskStatus::Failed;
                self.result_urls.clear();
                self.error_message = Some(message.clone());
                self.error_kind = Some(ErrorKind::Upstream);
            }
        }
        self.updated_at = Utc::now();
        true
    }
}
