//! Bearer-token authentication
//!
//! The token verifier resolves a signed token into a role; the gate wraps
//! a downstream handler and only lets verified requests through.

pub mod gate;
pub mod token;

pub use gate::{AuthGate, AuthenticatedHandler, RequestContext};
pub use token::{Role, RoleClaim, TokenVerifier};
