//! Token issuance constants

/// Default lifetime of an issued bearer assertion, in seconds.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 1800;

/// `nbf` is backdated by this many seconds to absorb clock skew with upstream.
pub const NOT_BEFORE_SKEW_SECS: i64 = 5;

/// Environment variable carrying `access:secret` pairs, comma separated.
pub const CREDENTIALS_ENV: &str = "UPSTREAM_CREDENTIALS";
