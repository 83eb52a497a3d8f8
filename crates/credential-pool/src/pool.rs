//! Credential pool with exclusion-set selection
//!
//! The pool is immutable after construction. Callers thread an explicit
//! `Exclusions` set through one submission's attempts; nothing about which
//! credentials were tried is stored here, so two concurrent submissions may
//! both pick the same credential and both be throttled. Each absorbs that
//! within its own attempts.

use std::collections::HashSet;

use rand::RngExt;
use tracing::{debug, info, warn};
use upstream_auth::{Credential, CredentialId};

use crate::error::{Error, Result};

/// Credential ids already tried during one submission attempt sequence.
pub type Exclusions = HashSet<CredentialId>;

/// Fixed-size set of credentials shared read-only by every submission.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
}

impl CredentialPool {
    /// Build a pool. Duplicate access keys are rejected because the access
    /// key is what exclusion sets are keyed by.
    pub fn new(credentials: Vec<Credential>) -> Result<Self> {
        let mut seen = HashSet::new();
        for credential in &credentials {
            if !seen.insert(credential.id()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate credential {}",
                    credential.id()
                )));
            }
        }
        if credentials.is_empty() {
            warn!("credential pool is empty, every upstream call will fail");
        }
        info!(credentials = credentials.len(), "credential pool initialized");
        Ok(Self { credentials })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Snapshot of the credential ids in configuration order.
    pub fn ids(&self) -> Vec<CredentialId> {
        self.credentials.iter().map(|c| c.access_key.clone()).collect()
    }

    /// Pick a credential not in `excluded`, uniformly at random.
    ///
    /// Returns `PoolExhausted` when `excluded` covers the whole pool
    /// (trivially true for an empty pool).
    pub fn acquire(&self, excluded: &Exclusions) -> Result<&Credential> {
        let candidates: Vec<&Credential> = self
            .credentials
            .iter()
            .filter(|c| !excluded.contains(c.id()))
            .collect();

        if candidates.is_empty() {
            return Err(Error::PoolExhausted(
                self.exhausted_message(excluded.len()),
            ));
        }

        let pick = rand::rng().random_range(0..candidates.len());
        let credential = candidates[pick];
        debug!(
            credential_id = credential.id(),
            candidates = candidates.len(),
            excluded = excluded.len(),
            "credential acquired"
        );
        Ok(credential)
    }

    /// Pool summary for the health endpoint. Credential ids only, never secrets.
    pub fn status(&self) -> serde_json::Value {
        let status = if self.credentials.is_empty() {
            "unhealthy"
        } else {
            "healthy"
        };
        serde_json::json!({
            "status": status,
            "credentials_total": self.credentials.len(),
            "credentials": self.ids(),
        })
    }

    fn exhausted_message(&self, excluded: usize) -> String {
        serde_json::json!({
            "error": {
                "type": "pool_exhausted",
                "message": "All credentials exhausted",
                "pool": {
                    "credentials_total": self.credentials.len(),
                    "credentials_excluded": excluded,
                }
            }
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(ids: &[&str]) -> CredentialPool {
        let creds = ids
            .iter()
            .map(|id| Credential::new(*id, format!("sk_{id}")).unwrap())
            .collect();
        CredentialPool::new(creds).unwrap()
    }

    #[test]
    fn acquire_returns_pool_member() {
        let pool = test_pool(&["a", "b", "c"]);
        let selected = pool.acquire(&Exclusions::new()).unwrap();
        assert!(["a", "b", "c"].contains(&selected.id()));
    }

    #[test]
    fn acquire_skips_excluded_credentials() {
        let pool = test_pool(&["a", "b", "c"]);
        let excluded: Exclusions = ["a".to_string(), "c".to_string()].into();
        for _ in 0..20 {
            assert_eq!(pool.acquire(&excluded).unwrap().id(), "b");
        }
    }

    #[test]
    fn acquire_spreads_over_members() {
        let pool = test_pool(&["a", "b"]);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(pool.acquire(&Exclusions::new()).unwrap().id().to_string());
        }
        assert_eq!(seen.len(), 2, "random selection should reach every member");
    }

    #[test]
    fn full_exclusion_is_exhausted_with_counts() {
        let pool = test_pool(&["a", "b"]);
        let excluded: Exclusions = ["a".to_string(), "b".to_string()].into();
        let err = pool.acquire(&excluded).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("pool_exhausted"), "error: {msg}");

        let json: serde_json::Value =
            serde_json::from_str(msg.strip_prefix("pool exhausted: ").unwrap_or(&msg)).unwrap();
        assert_eq!(json["error"]["pool"]["credentials_total"], 2);
        assert_eq!(json["error"]["pool"]["credentials_excluded"], 2);
    }

    #[test]
    fn empty_pool_is_exhausted() {
        let pool = CredentialPool::new(vec![]).unwrap();
        assert!(pool.is_empty());
        assert!(matches!(
            pool.acquire(&Exclusions::new()),
            Err(Error::PoolExhausted(_))
        ));
        assert_eq!(pool.status()["status"], "unhealthy");
    }

    #[test]
    fn unknown_exclusions_are_ignored() {
        let pool = test_pool(&["a"]);
        let excluded: Exclusions = ["zzz".to_string()].into();
        assert_eq!(pool.acquire(&excluded).unwrap().id(), "a");
    }

    #[test]
    fn duplicate_ids_rejected() {
        let creds = vec![
            Credential::new("a", "x").unwrap(),
            Credential::new("a", "y").unwrap(),
        ];
        assert!(matches!(
            CredentialPool::new(creds),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn status_lists_ids_without_secrets() {
        let pool = test_pool(&["a", "b"]);
        let status = pool.status();
        assert_eq!(status["status"], "healthy");
        assert_eq!(status["credentials_total"], 2);
        assert!(!status.to_string().contains("sk_a"));
    }
}
