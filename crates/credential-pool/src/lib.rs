//! Credential pool for the generation service
//!
//! Holds the fixed set of access/secret pairs loaded at startup and hands one
//! out per submission attempt. Selection is uniform-random over the members
//! not in the caller's exclusion set; the pool itself carries no per-request
//! history, so concurrent submissions never contend on shared state.
//!
//! Submission lifecycle (driven by the task orchestrator):
//! 1. `acquire(&excluded)` with an empty set → credential A
//! 2. Upstream answers with a throttle → caller adds A to `excluded`
//! 3. `acquire(&excluded)` → credential B, and so on
//! 4. Once `excluded` covers the pool → `PoolExhausted`
//!
//! `classify` maps upstream error responses onto the categories that drive
//! that loop (throttle vs content moderation vs anything else).

pub mod classify;
pub mod error;
pub mod pool;

pub use classify::{Classification, classify, classify_body};
pub use error::{Error, Result};
pub use pool::{CredentialPool, Exclusions};
