//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials come from `[[credentials]]` in the TOML or, when set, the
//! `UPSTREAM_CREDENTIALS` env var (`ak:sk,ak:sk`), which replaces the file
//! list entirely.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use upstream::UpstreamPaths;
use upstream_auth::{CREDENTIALS_ENV, Credential, DEFAULT_TOKEN_TTL_SECS, parse_credential_list};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// Local HTTP surface
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Scope used when a request doesn't name one
    #[serde(default = "default_scope")]
    pub default_scope: String,
}

/// Generation service endpoint and auth
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_submit_path")]
    pub submit_path: String,
    #[serde(default = "default_extend_path")]
    pub extend_path: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    File,
    Memory,
}

/// Polling, pagination and persistence
#[derive(Debug, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_store_kind")]
    pub store: StoreKind,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Poll newly submitted tasks in the background until they finish
    #[serde(default = "default_watch")]
    pub watch: bool,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            page_size: default_page_size(),
            store: default_store_kind(),
            store_path: default_store_path(),
            watch: default_watch(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_scope() -> String {
    "default".into()
}

fn default_submit_path() -> String {
    UpstreamPaths::default().submit
}

fn default_extend_path() -> String {
    UpstreamPaths::default().extend
}

fn default_timeout() -> u64 {
    30
}

fn default_token_ttl() -> i64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_poll_interval() -> u64 {
    5
}

fn default_page_size() -> usize {
    20
}

fn default_store_kind() -> StoreKind {
    StoreKind::File
}

fn default_store_path() -> PathBuf {
    PathBuf::from("tasks.json")
}

fn default_watch() -> bool {
    true
}

impl UpstreamConfig {
    pub fn paths(&self) -> UpstreamPaths {
        UpstreamPaths {
            submit: self.submit_path.clone(),
            extend: self.extend_path.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TasksConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(raw) = std::env::var(CREDENTIALS_ENV) {
            config.credentials = parse_credential_list(&raw).map_err(|e| {
                common::Error::Credential(format!("{CREDENTIALS_ENV}: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.upstream.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {base_url}"
            )));
        }

        for (name, path) in [
            ("submit_path", &self.upstream.submit_path),
            ("extend_path", &self.upstream.extend_path),
        ] {
            if !path.starts_with('/') {
                return Err(common::Error::Config(format!(
                    "{name} must start with '/', got: {path}"
                )));
            }
        }

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.upstream.token_ttl_secs <= 0 {
            return Err(common::Error::Config(
                "token_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.tasks.poll_interval_secs == 0 {
            return Err(common::Error::Config(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.tasks.page_size == 0 {
            return Err(common::Error::Config(
                "page_size must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.server.default_scope.trim().is_empty() {
            return Err(common::Error::Config("default_scope must not be empty".into()));
        }

        for credential in &self.credentials {
            credential
                .validate()
                .map_err(|e| common::Error::Credential(e.to_string()))?;
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("task-gateway.toml")
    }
}
