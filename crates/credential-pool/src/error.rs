//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
