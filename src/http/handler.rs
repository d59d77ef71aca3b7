use std::future::Future;

use crate::http::request::Request;
use crate::http::response::Response;

/// Turns a parsed request into a response.
///
/// One handler instance is shared by every connection, so it must be
/// usable concurrently.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> impl Future<Output = Response> + Send;
}
