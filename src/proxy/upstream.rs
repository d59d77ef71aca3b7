//! Upstream request forwarding
//!
//! Selects a backend for each authenticated request, relays the request to
//! it and hands the backend's response back. Backend failures become 502.

use crate::auth::{AuthenticatedHandler, RequestContext};
use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::http::headers::Headers;
use crate::http::parser::{
    parse_response_head, response_framing, BodyFraming, ChunkedDecoder, ParseError, ResponseHead,
};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder};
use crate::proxy::backend::{Backend, BackendPool};
use crate::proxy::connector::Connector;
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default buffer size for reading from backends
const BUFFER_SIZE: usize = 8192;

/// Largest response body relayed from a backend
const MAX_RESPONSE_BODY: usize = 64 * 1024 * 1024;

/// Headers that only describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// Request headers reserved for the proxy. A client-supplied copy is
/// dropped so backends never see a forged value.
const ROUTING_INTERNAL: &[&str] = &["Role"];

/// How a single exchange on one connection went wrong.
enum ExchangeError {
    /// The connection died before any response byte arrived.
    NoResponse(io::Error),
    Failed(GatewayError),
}

impl From<GatewayError> for ExchangeError {
    fn from(e: GatewayError) -> Self {
        ExchangeError::Failed(e)
    }
}

/// Handles proxying requests to backend servers
pub struct ProxyHandler {
    /// Pool of backend servers
    backend_pool: Arc<BackendPool>,

    /// Connection reuse per backend
    connector: Connector,

    /// Deadline for one complete backend exchange
    request_timeout: Duration,
}

impl ProxyHandler {
    /// Create a new proxy handler
    pub fn new(backend_pool: Arc<BackendPool>, config: &UpstreamConfig) -> Self {
        let connector = Connector::new(
            backend_pool.backends(),
            config.connect_timeout(),
            config.max_idle_per_backend,
        );

        Self {
            backend_pool,
            connector,
            request_timeout: config.request_timeout(),
        }
    }

    pub fn backend_pool(&self) -> &BackendPool {
        &self.backend_pool
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Forward `request` to `backend` and return the backend's response.
    ///
    /// The whole exchange, connecting included, is bounded by the request
    /// timeout. Failures are never retried on another backend.
    pub async fn forward(&self, request: &Request, backend: &Backend) -> Result<Response, GatewayError> {
        let request_bytes = build_http_request(request, backend);
        let head_request = request.method == Method::HEAD;

        timeout(
            self.request_timeout,
            self.exchange(backend, &request_bytes, head_request),
        )
        .await
        .map_err(|_| GatewayError::Timeout(self.request_timeout))?
    }

    async fn exchange(
        &self,
        backend: &Backend,
        request_bytes: &[u8],
        head_request: bool,
    ) -> Result<Response, GatewayError> {
        let checkout = self.connector.checkout(backend).await?;

        let result = match send_and_receive(checkout.stream, request_bytes, head_request).await {
            Err(ExchangeError::NoResponse(e)) if checkout.reused => {
                // The backend closed the idle connection; try once on a new one.
                tracing::debug!(
                    backend = backend.display_name(),
                    error = %e,
                    "Pooled connection was stale, reconnecting"
                );
                let stream = self.connector.connect(backend).await?;
                send_and_receive(stream, request_bytes, head_request).await
            }
            other => other,
        };

        match result {
            Ok((response, reusable)) => {
                if let Some(stream) = reusable {
                    self.connector.release(backend, stream).await;
                }
                Ok(response)
            }
            Err(ExchangeError::NoResponse(e)) => Err(GatewayError::Unreachable(e)),
            Err(ExchangeError::Failed(e)) => Err(e),
        }
    }
}

impl AuthenticatedHandler for ProxyHandler {
    fn handle(
        &self,
        request: Request,
        context: RequestContext,
    ) -> impl Future<Output = Response> + Send {
        async move {
            let selection = self.backend_pool.select(context.role.role);
            let backend = selection.backend;

            tracing::info!(
                backend = backend.display_name(),
                index = selection.index,
                role = %context.role.name,
                class = %context.role.role,
                method = %request.method,
                path = %request.path,
                "Forwarding request to backend"
            );

            match self.forward(&request, backend).await {
                Ok(response) => {
                    tracing::debug!(
                        backend = backend.display_name(),
                        status = response.status.as_u16(),
                        "Request forwarded successfully"
                    );
                    response
                }
                Err(e) => {
                    tracing::warn!(
                        backend = backend.display_name(),
                        role = %context.role.name,
                        error = %e,
                        method = %request.method,
                        path = %request.path,
                        "Failed to proxy request to backend"
                    );
                    Response::bad_gateway()
                }
            }
        }
    }
}

/// Build HTTP request bytes to send to `backend`.
///
/// The backend's base path is prefixed to the request target, `Host` is
/// rewritten, hop-by-hop and routing-internal headers are dropped, and the
/// connection is asked to stay open for reuse.
pub fn build_http_request(request: &Request, backend: &Backend) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(512 + request.body.len());

    let target = upstream_target(backend, &request.path);
    buffer.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method, target).as_bytes());

    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    for name in ROUTING_INTERNAL {
        headers.remove(name);
    }
    headers.insert("Host", backend.authority());
    if !request.body.is_empty() || headers.contains("Content-Length") {
        headers.insert("Content-Length", request.body.len().to_string());
    }
    headers.insert("Connection", "keep-alive");

    for (key, value) in headers.iter() {
        buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }

    // End of headers
    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);

    buffer
}

fn upstream_target(backend: &Backend, path: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    let base = backend.url.path().trim_end_matches('/');

    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else if base.is_empty() {
        // asterisk-form or authority-form targets pass through untouched
        path.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

/// Removes hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut Headers) {
    let listed: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP.iter().copied()) {
        headers.remove(name);
    }
}

/// Writes one request and reads one response.
///
/// On success also returns the stream if it can carry another request.
async fn send_and_receive(
    mut stream: TcpStream,
    request_bytes: &[u8],
    head_request: bool,
) -> Result<(Response, Option<TcpStream>), ExchangeError> {
    stream
        .write_all(request_bytes)
        .await
        .map_err(ExchangeError::NoResponse)?;
    stream.flush().await.map_err(ExchangeError::NoResponse)?;

    tracing::trace!("Request sent to backend");

    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let head = read_response_head(&mut stream, &mut buffer).await?;

    let framing = response_framing(&head, head_request).map_err(bad_response)?;
    let body = read_response_body(&mut stream, &mut buffer, framing).await?;

    let reusable = framing != BodyFraming::UntilClose
        && buffer.is_empty()
        && keeps_alive(&head);

    let mut headers = head.headers;
    strip_hop_by_hop(&mut headers);
    if matches!(framing, BodyFraming::Chunked | BodyFraming::UntilClose) {
        headers.insert("Content-Length", body.len().to_string());
    }

    let mut builder = ResponseBuilder::new(head.status).headers(headers).body(body);
    if head.reason != head.status.reason_phrase() {
        builder = builder.reason(head.reason);
    }

    Ok((builder.build(), reusable.then_some(stream)))
}

/// Reads until a final (non-1xx) response head is available.
async fn read_response_head(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
) -> Result<ResponseHead, ExchangeError> {
    let mut received_any = false;

    loop {
        match parse_response_head(buffer) {
            Ok((head, consumed)) => {
                buffer.advance(consumed);
                // Interim responses such as 100 Continue are skipped.
                if (100..200).contains(&head.status.as_u16()) && head.status.as_u16() != 101 {
                    continue;
                }
                return Ok(head);
            }
            Err(ParseError::Incomplete) => {}
            Err(e) => return Err(bad_response(e).into()),
        }

        let n = match stream.read_buf(buffer).await {
            Ok(n) => n,
            Err(e) if !received_any => return Err(ExchangeError::NoResponse(e)),
            Err(e) => return Err(GatewayError::Unreachable(e).into()),
        };

        if n == 0 {
            if received_any {
                return Err(GatewayError::BadResponse(
                    "connection closed before complete response headers".to_string(),
                )
                .into());
            }
            return Err(ExchangeError::NoResponse(io::ErrorKind::UnexpectedEof.into()));
        }
        received_any = true;
    }
}

/// Read the response body according to its framing.
async fn read_response_body(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    framing: BodyFraming,
) -> Result<Vec<u8>, GatewayError> {
    match framing {
        BodyFraming::Empty => Ok(Vec::new()),

        BodyFraming::Length(len) => {
            if len > MAX_RESPONSE_BODY {
                return Err(GatewayError::BadResponse("response body too large".to_string()));
            }
            while buffer.len() < len {
                read_more(stream, buffer, "body").await?;
            }
            Ok(buffer.split_to(len).to_vec())
        }

        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new(MAX_RESPONSE_BODY);
            loop {
                let used = decoder.decode(buffer).map_err(bad_response)?;
                buffer.advance(used);
                if decoder.is_done() {
                    return Ok(decoder.into_body());
                }
                read_more(stream, buffer, "chunked body").await?;
            }
        }

        BodyFraming::UntilClose => {
            loop {
                if buffer.len() > MAX_RESPONSE_BODY {
                    return Err(GatewayError::BadResponse("response body too large".to_string()));
                }
                let n = stream
                    .read_buf(buffer)
                    .await
                    .map_err(GatewayError::Unreachable)?;
                if n == 0 {
                    break;
                }
            }
            Ok(buffer.split().to_vec())
        }
    }
}

async fn read_more(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    what: &str,
) -> Result<(), GatewayError> {
    buffer.reserve(BUFFER_SIZE);
    let n = stream
        .read_buf(buffer)
        .await
        .map_err(GatewayError::Unreachable)?;
    if n == 0 {
        return Err(GatewayError::BadResponse(format!(
            "connection closed before complete {}",
            what
        )));
    }
    Ok(())
}

fn keeps_alive(head: &ResponseHead) -> bool {
    if head.headers.has_token("Connection", "close") {
        return false;
    }
    head.version == "HTTP/1.1" || head.headers.has_token("Connection", "keep-alive")
}

fn bad_response(e: ParseError) -> GatewayError {
    GatewayError::BadResponse(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn backend(url: &str) -> Backend {
        Backend::new(BackendConfig::new(url)).unwrap()
    }

    #[test]
    fn target_keeps_backend_base_path() {
        assert_eq!(upstream_target(&backend("http://h:1"), "/a?b=c"), "/a?b=c");
        assert_eq!(upstream_target(&backend("http://h:1/api/"), "/users"), "/api/users");
        assert_eq!(upstream_target(&backend("http://h:1/api"), ""), "/api/");
        assert_eq!(upstream_target(&backend("http://h:1"), "*"), "*");
    }

    #[test]
    fn headers_named_by_connection_are_dropped() {
        let mut headers = Headers::new();
        headers.append("Connection", "X-Session, keep-alive");
        headers.append("X-Session", "abc");
        headers.append("Accept", "*/*");

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains("X-Session"));
        assert!(!headers.contains("Connection"));
        assert_eq!(headers.get("Accept"), Some("*/*"));
    }
}
