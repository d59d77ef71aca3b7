//! Bearer token verification.
//!
//! Tokens are HMAC-signed JWTs carrying a string `role` claim. The signing
//! secret is fixed at startup; nothing in this module logs it or the token.

use crate::config::AuthConfig;
use crate::error::{AuthError, ConfigError};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Tokens above this size are rejected before any parsing.
pub const MAX_TOKEN_BYTES: usize = 8192;

/// Routing class of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Always routed to the first backend in the pool.
    Privileged,
    /// Load-balanced round-robin across the pool.
    Standard,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Privileged => f.write_str("privileged"),
            Role::Standard => f.write_str("standard"),
        }
    }
}

/// A verified role together with the claim string it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleClaim {
    pub role: Role,
    /// Raw `role` claim, kept for logs and audit.
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    role: String,
}

/// Verifies signed tokens and resolves their role claim.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
    privileged_roles: Vec<String>,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("privileged_roles", &self.privileged_roles)
            .field("leeway", &self.validation.leeway)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Creates a verifier for tokens signed with `secret`.
    ///
    /// `privileged_roles` are matched case-sensitively against the `role`
    /// claim. `leeway_secs` is the clock skew allowed when checking `exp`.
    pub fn new(secret: &[u8], privileged_roles: Vec<String>, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        // `exp` is optional, but checked whenever it is present.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = leeway_secs;

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            privileged_roles,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let secret = config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSecret)?;

        Ok(Self::new(
            secret.as_bytes(),
            config.privileged_roles.clone(),
            config.leeway_secs,
        ))
    }

    /// Verifies `token` and returns its role.
    ///
    /// Every failure collapses into `AuthError::Invalid`; the cause is only
    /// visible in debug logs.
    pub fn verify(&self, token: &str) -> Result<RoleClaim, AuthError> {
        if token.is_empty() || token.len() > MAX_TOKEN_BYTES {
            tracing::debug!(len = token.len(), "Token rejected by size check");
            return Err(AuthError::Invalid);
        }

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Token verification failed");
            AuthError::Invalid
        })?;

        let name = data.claims.role;
        Ok(RoleClaim {
            role: self.classify(&name),
            name,
        })
    }

    /// Maps a role claim to its routing class.
    ///
    /// Unknown role names are not an error; they route as `Standard`.
    pub fn classify(&self, role: &str) -> Role {
        if self.privileged_roles.iter().any(|r| r == role) {
            Role::Privileged
        } else {
            Role::Standard
        }
    }
}
