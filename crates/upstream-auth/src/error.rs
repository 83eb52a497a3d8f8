//! Error types for credential handling and token signing

/// Errors from authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
