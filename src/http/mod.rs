//! HTTP/1.1 protocol implementation.
//!
//! # Architecture
//!
//! - **`connection`**: per-connection request-response state machine
//! - **`handler`**: the trait connections dispatch parsed requests to
//! - **`headers`**: ordered, case-insensitive header list
//! - **`parser`**: request parsing, response head parsing, chunked decoding
//! - **`request`**: HTTP request representation
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: serialises and writes responses to the client
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received (malformed → 400, then Closed)
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Handler runs; client disconnect aborts it
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod connection;
pub mod handler;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

pub use handler::Handler;
pub use headers::Headers;
