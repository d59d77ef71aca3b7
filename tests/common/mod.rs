//! Shared helpers for integration tests: token minting, in-process
//! backends and a minimal raw HTTP client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use jsonwebtoken::{encode, EncodingKey, Header};
use rolegate::config::Config;
use rolegate::http::headers::Headers;
use rolegate::http::parser::{parse_http_request, parse_response_head};
use rolegate::server::{self, Gateway};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const SECRET: &str = "test-signing-secret";

#[derive(Debug, Serialize)]
pub struct TestClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Signs arbitrary claims with HS256.
pub fn sign(claims: &TestClaims, secret: &str) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("failed to sign test token")
}

/// Token for `role` expiring in one hour.
pub fn token_for(role: &str) -> String {
    sign(
        &TestClaims {
            role: Some(role.to_string()),
            exp: Some((chrono::Utc::now() + chrono::Duration::hours(1)).timestamp()),
        },
        SECRET,
    )
}

/// Starts a backend answering every request with `name` as the body.
///
/// It also reports what it received in `X-Seen-*` headers and keeps
/// connections alive between requests.
pub async fn spawn_backend(name: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                loop {
                    let (request, consumed) = loop {
                        if let Ok(parsed) = parse_http_request(&buf, 1 << 20) {
                            break parsed;
                        }
                        let mut chunk = [0u8; 4096];
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    };
                    buf.drain(..consumed);

                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Backend: {}\r\nX-Seen-Method: {}\r\nX-Seen-Path: {}\r\nX-Seen-Role: {}\r\nX-Seen-Body: {}\r\nX-Seen-Host: {}\r\n\r\n{}",
                        name.len(),
                        name,
                        request.method,
                        request.path,
                        request.header("Role").unwrap_or("none"),
                        String::from_utf8_lossy(&request.body),
                        request.header("Host").unwrap_or(""),
                        name,
                    );
                    if socket.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    format!("http://{}", addr)
}

/// Starts a backend that replies with a fixed raw response and closes.
pub async fn spawn_raw_backend(raw: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if !read_one_request(&mut socket).await {
                    return;
                }
                let _ = socket.write_all(raw).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Starts a backend that accepts connections but never answers.
pub async fn spawn_silent_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    format!("http://{}", addr)
}

/// Reads from `socket` until one whole request has arrived.
///
/// Returns false if the peer hung up first.
async fn read_one_request(socket: &mut TcpStream) -> bool {
    let mut buf = Vec::new();
    while parse_http_request(&buf, 1 << 20).is_err() {
        let mut chunk = [0u8; 4096];
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    true
}

/// What a hanging backend saw on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    Received,
    Closed,
}

/// Starts a backend that reads a request, never answers, and reports when
/// the proxy side of the connection goes away.
pub async fn spawn_hanging_backend() -> (String, mpsc::UnboundedReceiver<BackendEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                if !read_one_request(&mut socket).await {
                    return;
                }
                let _ = tx.send(BackendEvent::Received);

                let mut chunk = [0u8; 1024];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                let _ = tx.send(BackendEvent::Closed);
            });
        }
    });

    (format!("http://{}", addr), rx)
}

/// Starts a backend that counts accepted connections. Each connection gets
/// one request read, `reply` written if there is one, and is then closed
/// even though `reply` may advertise keep-alive.
pub async fn spawn_counting_backend(reply: Option<&'static [u8]>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if !read_one_request(&mut socket).await {
                    return;
                }
                if let Some(reply) = reply {
                    let _ = socket.write_all(reply).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), connections)
}

/// URL of a local port nothing listens on.
pub async fn unreachable_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn config_for(backends: &[String], extra: &[(&str, &str)]) -> Config {
    let list = backends.join(",");
    Config::from_lookup(|key| match key {
        "BACKENDS" => Some(list.clone()),
        "JWT_SECRET" => Some(SECRET.to_string()),
        _ => extra
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string()),
    })
    .unwrap()
}

/// Builds the gateway for `cfg` and serves it on an ephemeral port.
pub async fn start_gateway(cfg: &Config) -> (SocketAddr, Arc<Gateway>) {
    let gateway = server::build(cfg).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handler = Arc::clone(&gateway);
    let max_body = cfg.server.max_body_bytes;
    tokio::spawn(async move {
        let _ = server::listener::serve(listener, handler, max_body).await;
    });

    (addr, gateway)
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends raw request bytes on a fresh connection and reads the reply until
/// the server closes it. Requests should carry `Connection: close`.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();

    let (head, body_start) = parse_response_head(&out).unwrap();
    RawResponse {
        status: head.status.as_u16(),
        headers: head.headers,
        body: out[body_start..].to_vec(),
    }
}

/// GET `path` with an optional raw `Authorization` header value.
pub async fn get(addr: SocketAddr, path: &str, authorization: Option<&str>) -> RawResponse {
    let mut request = format!("GET {} HTTP/1.1\r\nHost: gateway\r\nConnection: close\r\n", path);
    if let Some(value) = authorization {
        request.push_str(&format!("Authorization: {}\r\n", value));
    }
    request.push_str("\r\n");
    send_raw(addr, request.as_bytes()).await
}

pub async fn get_as(addr: SocketAddr, role: &str) -> RawResponse {
    get(addr, "/", Some(&format!("Bearer {}", token_for(role)))).await
}
