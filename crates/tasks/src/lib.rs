//! Generation task lifecycle
//!
//! Owns the `GenerationTask` record from submission to terminal result:
//!
//! - `Orchestrator::submit` validates, creates a skeleton and rotates through
//!   the credential pool on throttling
//! - `Orchestrator::poll_once` / `watch` advance a task through
//!   `Pending -> Processing -> {Succeeded | Failed}`
//! - `Orchestrator::extend` chains a follow-on job off a succeeded result
//! - `TaskStore` persists records; `WorkingSet` is the per-scope session view

pub mod error;
pub mod file_store;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod poller;
pub mod store;
pub mod working_set;

pub use error::{ErrorKind, Result, TaskError};
pub use file_store::FileTaskStore;
pub use lifecycle::{Transition, apply};
pub use model::{GenerationTask, SubmissionParams, TaskStatus, validate_extension};
pub use orchestrator::{
    DEFAULT_PAGE_SIZE, DEFAULT_POLL_INTERVAL, Orchestrator, OrchestratorConfig, SubmitFailure,
    SubmitOutcome,
};
pub use poller::{PollExit, PollHandle};
pub use store::{MemoryTaskStore, StoreError, StoreFuture, StoreResult, TaskStore};
pub use working_set::WorkingSet;
