//! Process assembly: turns a `Config` into a ready-to-serve gateway.

pub mod listener;

use std::sync::Arc;

use crate::auth::{AuthGate, TokenVerifier};
use crate::config::Config;
use crate::error::ConfigError;
use crate::proxy::{BackendPool, ProxyHandler};

/// The full request pipeline: auth gate in front of the forwarding proxy.
pub type Gateway = AuthGate<ProxyHandler>;

/// Builds the gateway, failing fast on any configuration problem.
///
/// An empty backend list or a missing signing secret stops the process here,
/// before anything is bound.
pub fn build(cfg: &Config) -> Result<Arc<Gateway>, ConfigError> {
    let verifier = TokenVerifier::from_config(&cfg.auth)?;
    let pool = Arc::new(BackendPool::new(cfg.backends.clone())?);

    for (index, backend) in pool.backends().iter().enumerate() {
        tracing::info!(
            index,
            backend = backend.display_name(),
            url = %backend.url,
            "Registered backend"
        );
    }

    let proxy = ProxyHandler::new(pool, &cfg.upstream);
    Ok(Arc::new(AuthGate::new(verifier, proxy)))
}
