//! Access/secret credential pairs
//!
//! Credentials are loaded once at process start and never mutated. A pool of
//! them is shared read-only by every concurrent submission; the access key
//! doubles as the credential's identity for exclusion sets and logging.

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Identity of a credential within the pool (its access key).
pub type CredentialId = String;

/// One access/secret pair usable to authenticate against upstream.
///
/// The secret key only ever leaves this struct as an HMAC key; `Debug`
/// output redacts it.
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub access_key: String,
    pub secret_key: Secret<String>,
}

impl Credential {
    /// Build a credential, rejecting blank halves.
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        let credential = Self {
            access_key: access_key.into(),
            secret_key: Secret::new(secret_key.into()),
        };
        credential.validate()?;
        Ok(credential)
    }

    pub fn id(&self) -> &str {
        &self.access_key
    }

    /// Check that neither half is blank.
    pub fn validate(&self) -> Result<()> {
        if self.access_key.trim().is_empty() {
            return Err(Error::InvalidCredentials("access key is empty".into()));
        }
        if self.secret_key.expose().trim().is_empty() {
            return Err(Error::InvalidCredentials(format!(
                "secret key for {} is empty",
                self.access_key
            )));
        }
        Ok(())
    }
}

/// Parse a comma-separated `access:secret` list (the `UPSTREAM_CREDENTIALS` format).
///
/// Whitespace around entries is ignored and empty entries are skipped.
/// Duplicate access keys are rejected since the access key is the identity.
pub fn parse_credential_list(raw: &str) -> Result<Vec<Credential>> {
    let mut credentials: Vec<Credential> = Vec::new();
    for (index, entry) in raw.split(',').map(str::trim).enumerate() {
        if entry.is_empty() {
            continue;
        }
        let (access, secret) = entry.split_once(':').ok_or_else(|| {
            Error::CredentialParse(format!("entry {index} is not in access:secret form"))
        })?;
        let credential = Credential::new(access.trim(), secret.trim())
            .map_err(|e| Error::CredentialParse(format!("entry {index}: {e}")))?;
        if credentials.iter().any(|c| c.access_key == credential.access_key) {
            return Err(Error::CredentialParse(format!(
                "duplicate access key {}",
                credential.access_key
            )));
        }
        credentials.push(credential);
    }
    debug!(count = credentials.len(), "parsed credential list");
    Ok(credentials)
}
