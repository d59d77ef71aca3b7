//! Reverse proxy functionality
//!
//! This module implements the core reverse proxy logic: the backend pool
//! with its role-aware selection, outbound connection reuse, and request
//! forwarding.

pub mod backend;
pub mod connector;
pub mod upstream;

pub use backend::{Backend, BackendPool, Selection};
pub use connector::Connector;
pub use upstream::ProxyHandler;
