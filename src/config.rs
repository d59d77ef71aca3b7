//! Process configuration.
//!
//! Loaded once at startup from an optional YAML file (`ROLEGATE_CONFIG`)
//! and then overridden by environment variables. Immutable afterwards.

use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub backends: Vec<BackendConfig>,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Largest request body accepted from clients.
    pub max_body_bytes: usize,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub secret: Option<String>,
    /// Role claims routed to the dedicated first backend.
    pub privileged_roles: Vec<String>,
    pub leeway_secs: u64,
}

/// One backend entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_idle_per_backend: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            privileged_roles: vec!["Admin".to_string()],
            leeway_secs: 0,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("privileged_roles", &self.privileged_roles)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            request_timeout_ms: 30_000,
            max_idle_per_backend: 8,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
        }
    }
}

fn default_backends() -> Vec<BackendConfig> {
    (1..=3)
        .map(|i| BackendConfig {
            url: format!("http://127.0.0.1:{}", 8080 + i),
            name: Some(format!("backend-{i}")),
        })
        .collect()
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration using `lookup` in place of the environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match lookup("ROLEGATE_CONFIG") {
            Some(path) => Self::from_file(&path)?,
            None => Self {
                backends: default_backends(),
                ..Self::default()
            },
        };

        if let Some(listen) = lookup("LISTEN") {
            cfg.server.listen_addr = listen;
        }
        if let Some(list) = lookup("BACKENDS") {
            cfg.backends = split_list(&list).map(BackendConfig::new).collect();
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            cfg.auth.secret = Some(secret);
        }
        if let Some(roles) = lookup("PRIVILEGED_ROLES") {
            cfg.auth.privileged_roles = split_list(&roles).map(str::to_string).collect();
        }
        if let Some(ms) = lookup("REQUEST_TIMEOUT_MS") {
            cfg.upstream.request_timeout_ms = ms.trim().parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "REQUEST_TIMEOUT_MS",
                    value: ms.clone(),
                }
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parses a YAML document. Omitted sections take their defaults; an
    /// omitted `backends` list stays empty.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upstream.connect_timeout_ms",
                value: "0".to_string(),
            });
        }
        if self.upstream.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upstream.request_timeout_ms",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}
