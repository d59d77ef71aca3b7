//! Backend pool and role-aware selection
//!
//! The pool is built once from configuration and never changes. The only
//! mutable piece is the round-robin cursor, advanced with a single atomic
//! `fetch_add`.

use crate::auth::Role;
use crate::config::BackendConfig;
use crate::error::ConfigError;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

/// A backend server identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Base URL (e.g., "http://localhost:3000/")
    pub url: Url,

    /// Optional backend name for logging
    pub name: Option<String>,

    authority: String,
}

impl Backend {
    /// Create a backend from configuration, validating its URL.
    pub fn new(config: BackendConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBackend {
            url: config.url.clone(),
            reason: reason.to_string(),
        };

        let url = Url::parse(&config.url).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid("only http:// backends are supported"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let authority = format!("{}:{}", host, port);

        Ok(Self {
            url,
            name: config.name,
            authority,
        })
    }

    /// Get a display name for the backend (name or URL)
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.url.as_str())
    }

    /// `host:port` to connect to, also used as the `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

/// One routing decision.
#[derive(Debug, Clone, Copy)]
pub struct Selection<'a> {
    pub index: usize,
    pub backend: &'a Backend,
}

/// Fixed, non-empty pool of backends.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Backend>,
    cursor: AtomicUsize,
}

impl BackendPool {
    /// Create a pool from configuration.
    ///
    /// Fails with `ConfigError::EmptyPool` when no backends are given.
    pub fn new(configs: Vec<BackendConfig>) -> Result<Self, ConfigError> {
        let backends = configs
            .into_iter()
            .map(Backend::new)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_backends(backends)
    }

    pub fn from_backends(backends: Vec<Backend>) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::EmptyPool);
        }

        Ok(Self {
            backends,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Starts the round-robin cursor at `start` instead of zero.
    pub fn with_cursor(self, start: usize) -> Self {
        self.cursor.store(start, Ordering::Relaxed);
        self
    }

    /// Picks the backend for a request carrying `role`.
    ///
    /// Privileged requests always get index 0 and leave the cursor alone.
    /// Everything else advances the cursor first and then indexes, so a
    /// fresh pool of three hands out 1, 2, 0, 1, ...
    pub fn select(&self, role: Role) -> Selection<'_> {
        let index = match role {
            Role::Privileged => 0,
            Role::Standard => {
                let cursor = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                cursor % self.backends.len()
            }
        };

        Selection {
            index,
            backend: &self.backends[index],
        }
    }

    /// Current cursor value.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn get(&self, index: usize) -> Option<&Backend> {
        self.backends.get(index)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false; an empty pool cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
