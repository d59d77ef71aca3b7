//! rolegate - role-aware reverse proxy
//!
//! Authenticates requests with a bearer token, routes privileged roles to a
//! dedicated backend and round-robins everyone else across the pool.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod server;
