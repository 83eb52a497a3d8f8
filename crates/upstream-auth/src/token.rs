//! Short-lived bearer assertions
//!
//! Every upstream call carries a freshly signed HS256 JWT whose issuer is the
//! credential's access key. Tokens are never cached: issuing one per request
//! means no token can expire mid-flight or be reused after a clock jump.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_TOKEN_TTL_SECS, NOT_BEFORE_SKEW_SECS};
use crate::credentials::Credential;
use crate::error::{Error, Result};

/// Claims carried in the assertion payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Access key of the signing credential
    pub iss: String,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Not-before (unix seconds), backdated by the skew allowance
    pub nbf: i64,
}

/// A signed assertion bound to one credential. Ephemeral: never persisted.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub credential_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
}

impl AuthToken {
    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Signs assertions with a configurable TTL.
#[derive(Debug, Clone, Copy)]
pub struct TokenIssuer {
    ttl: Duration,
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        }
    }
}

impl TokenIssuer {
    /// Create an issuer with the given TTL in seconds. Zero or negative TTLs
    /// would mint already-expired tokens and are rejected.
    pub fn new(ttl_secs: i64) -> Result<Self> {
        if ttl_secs <= 0 {
            return Err(Error::Signing(format!(
                "token ttl must be positive, got {ttl_secs}"
            )));
        }
        Ok(Self {
            ttl: Duration::seconds(ttl_secs),
        })
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl.num_seconds()
    }

    /// Issue a token for `credential` valid from now.
    pub fn issue(&self, credential: &Credential) -> Result<AuthToken> {
        self.issue_at(credential, Utc::now())
    }

    /// Issue a token as if the current time were `now`.
    pub fn issue_at(&self, credential: &Credential, now: DateTime<Utc>) -> Result<AuthToken> {
        credential.validate()?;

        let expires_at = now + self.ttl;
        let not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
        let claims = Claims {
            iss: credential.access_key.clone(),
            exp: expires_at.timestamp(),
            nbf: not_before.timestamp(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(credential.secret_key.expose().as_bytes()),
        )
        .map_err(|e| Error::Signing(e.to_string()))?;

        Ok(AuthToken {
            token,
            credential_id: credential.access_key.clone(),
            issued_at: now,
            expires_at,
            not_before,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};

    fn credential() -> Credential {
        Credential::new("ak-test", "sk-test-secret").unwrap()
    }

    #[test]
    fn token_has_three_segments_and_hs256_header() {
        let token = TokenIssuer::default().issue(&credential()).unwrap();
        assert_eq!(token.token.split('.').count(), 3);

        let header = decode_header(&token.token).unwrap();
        assert_eq!(header.alg, Algorithm::HS256);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
    }

    #[test]
    fn claims_carry_issuer_expiry_and_skewed_not_before() {
        let now = Utc::now();
        let token = TokenIssuer::default().issue_at(&credential(), now).unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&["ak-test"]);
        validation.validate_nbf = true;
        let data = decode::<Claims>(
            &token.token,
            &DecodingKey::from_secret(b"sk-test-secret"),
            &validation,
        )
        .unwrap();

        assert_eq!(data.claims.iss, "ak-test");
        assert_eq!(data.claims.exp, now.timestamp() + DEFAULT_TOKEN_TTL_SECS);
        assert_eq!(data.claims.nbf, now.timestamp() - NOT_BEFORE_SKEW_SECS);
        assert_eq!(token.expires_at - token.issued_at, Duration::seconds(1800));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let token = TokenIssuer::default().issue(&credential()).unwrap();
        let result = decode::<Claims>(
            &token.token,
            &DecodingKey::from_secret(b"other-secret"),
            &Validation::new(Algorithm::HS256),
        );
        assert!(result.is_err(), "token signed with another key must not verify");
    }

    #[test]
    fn custom_ttl_is_applied() {
        let issuer = TokenIssuer::new(60).unwrap();
        let token = issuer.issue(&credential()).unwrap();
        assert_eq!(issuer.ttl_secs(), 60);
        assert_eq!((token.expires_at - token.issued_at).num_seconds(), 60);
    }

    #[test]
    fn non_positive_ttl_rejected() {
        assert!(TokenIssuer::new(0).is_err());
        assert!(TokenIssuer::new(-30).is_err());
    }

    #[test]
    fn each_issue_is_independent() {
        let issuer = TokenIssuer::default();
        let cred = credential();
        let first = issuer.issue_at(&cred, Utc::now()).unwrap();
        let second = issuer
            .issue_at(&cred, Utc::now() + Duration::seconds(10))
            .unwrap();
        assert_ne!(first.token, second.token);
        assert!(second.bearer().starts_with("Bearer "));
    }

    #[test]
    fn claims_serialize_with_short_names() {
        let claims = Claims {
            iss: "ak".into(),
            exp: 10,
            nbf: 1,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json, serde_json::json!({"iss": "ak", "exp": 10, "nbf": 1}));
    }
}
