//! Authentication in front of the proxy.

use std::future::Future;

use crate::auth::token::{RoleClaim, TokenVerifier};
use crate::error::AuthError;
use crate::http::handler::Handler;
use crate::http::request::Request;
use crate::http::response::Response;

/// Per-request data produced by a successful authentication.
///
/// Lives beside the request rather than in its headers, so nothing the
/// client sends can set it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub role: RoleClaim,
}

/// A handler that only ever sees authenticated requests.
pub trait AuthenticatedHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: Request,
        context: RequestContext,
    ) -> impl Future<Output = Response> + Send;
}

/// Rejects requests without a valid bearer token and passes the rest on.
#[derive(Debug)]
pub struct AuthGate<H> {
    verifier: TokenVerifier,
    inner: H,
}

impl<H> AuthGate<H> {
    pub fn new(verifier: TokenVerifier, inner: H) -> Self {
        Self { verifier, inner }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Extracts and verifies the bearer token of `request`.
    pub fn authenticate(&self, request: &Request) -> Result<RequestContext, AuthError> {
        let header = request
            .header("Authorization")
            .filter(|v| !v.trim().is_empty())
            .ok_or(AuthError::MissingCredential)?;

        // The scheme prefix is optional; a bare token is accepted too.
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();

        let role = self.verifier.verify(token)?;
        Ok(RequestContext { role })
    }
}

impl<H: AuthenticatedHandler> Handler for AuthGate<H> {
    fn handle(&self, request: Request) -> impl Future<Output = Response> + Send {
        async move {
            match self.authenticate(&request) {
                Ok(context) => self.inner.handle(request, context).await,
                Err(e) => {
                    tracing::info!(
                        method = %request.method,
                        path = %request.path,
                        reason = %e,
                        "Rejected unauthenticated request"
                    );
                    Response::unauthorized(e.client_message())
                }
            }
        }
    }
}
