//! Error types shared across the proxy.
//!
//! Messages returned to clients are fixed strings; the variants here carry
//! detail for the server-side logs only.

use thiserror::Error;

/// Authentication failures raised by the auth gate and token verifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `Authorization` header on the request.
    #[error("missing credential")]
    MissingCredential,

    /// Bad signature, malformed token, expired token or missing role claim.
    #[error("invalid token")]
    Invalid,
}

impl AuthError {
    /// Body sent back to the client for this failure.
    pub fn client_message(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "Missing Token",
            AuthError::Invalid => "Invalid Token",
        }
    }
}

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backend pool is empty")]
    EmptyPool,

    #[error("invalid backend url {url}: {reason}")]
    InvalidBackend { url: String, reason: String },

    #[error("no signing secret configured (set JWT_SECRET or auth.secret)")]
    MissingSecret,

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Failures while talking to a backend. Every variant maps to 502.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("backend unreachable: {0}")]
    Unreachable(#[source] std::io::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid response from backend: {0}")]
    BadResponse(String),
}
