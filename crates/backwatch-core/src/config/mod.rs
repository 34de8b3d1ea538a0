//! Server configuration
//!
//! Connection settings for a Backrest server: base URL, Basic Auth
//! credentials, and reconnect tuning. Loadable from a TOML file with
//! environment variable overrides.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors produced while loading or validating server configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("no server URL configured")]
    MissingUrl,
}

/// Connection settings for one Backrest server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the server, e.g. `http://localhost:9898`
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Whether failed streams should be reopened automatically
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts. When unset, each session variant
    /// applies its own default (the shared feed and the log tail differ).
    #[serde(default)]
    pub reconnect_interval_ms: Option<u64>,
    /// Maximum reconnect attempts, 0 = unlimited
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl ServerConfig {
    /// Minimal config pointing at a server URL, everything else defaulted
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: String::new(),
            password: String::new(),
            auto_reconnect: false,
            reconnect_interval_ms: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display_path = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display_path.clone(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display_path.clone(),
            source,
        })?;
        debug!("Loaded server config from {}", display_path);
        Ok(config)
    }

    /// Apply `BACKWATCH_URL` / `BACKWATCH_USERNAME` / `BACKWATCH_PASSWORD`
    /// overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source (testable seam)
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("BACKWATCH_URL") {
            self.url = url;
        }
        if let Some(username) = var("BACKWATCH_USERNAME") {
            self.username = username;
        }
        if let Some(password) = var("BACKWATCH_PASSWORD") {
            self.password = password;
        }
    }

    /// Fail fast when the config cannot possibly reach a server
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        Ok(())
    }

    /// Base URL for HTTP calls: scheme preserved, trailing slash trimmed,
    /// `http://` assumed when no scheme is given
    pub fn http_base_url(&self) -> String {
        let trimmed = self.url.trim().trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        }
    }

    /// `host:port` target with any `http://` / `https://` prefix stripped
    pub fn stream_target(&self) -> String {
        strip_http_prefix(self.url.trim().trim_end_matches('/'))
    }

    /// True when the configured URL requires TLS
    pub fn uses_tls(&self) -> bool {
        self.url.trim().starts_with("https://")
    }

    /// Metadata to attach to every upstream call. Empty unless both
    /// username and password are set.
    pub fn auth_metadata(&self) -> AuthMetadata {
        AuthMetadata::basic_auth(&self.username, &self.password)
    }
}

/// Strip `http://` or `https://` so we have a proper `host:port` target
pub fn strip_http_prefix(url: &str) -> String {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .to_string()
}

/// Header name/value pairs attached to each upstream call
#[derive(Debug, Clone, Default)]
pub struct AuthMetadata {
    entries: Vec<(String, String)>,
}

impl AuthMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Basic Auth metadata; empty when either credential is missing
    pub fn basic_auth(username: &str, password: &str) -> Self {
        let mut metadata = Self::new();
        if !username.is_empty() && !password.is_empty() {
            let encoded = BASE64.encode(format!("{}:{}", username, password));
            metadata.insert("Authorization", format!("Basic {}", encoded));
        }
        metadata
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
