//! Upstream authentication library
//!
//! Holds the access/secret credential pairs used against the generation
//! service and turns one of them into a short-lived signed bearer assertion.
//! Nothing here talks to the network: the upstream client asks the
//! `TokenIssuer` for a fresh token immediately before every call.
//!
//! Credential flow:
//! 1. Gateway config yields `Vec<Credential>` (TOML table or `UPSTREAM_CREDENTIALS`)
//! 2. `credential-pool` selects one credential per attempt
//! 3. `TokenIssuer::issue()` signs `{iss, exp, nbf}` with the secret key
//! 4. The token is attached as `Authorization: Bearer …` and then dropped

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{Credential, CredentialId, parse_credential_list};
pub use error::{Error, Result};
pub use token::{AuthToken, Claims, TokenIssuer};
