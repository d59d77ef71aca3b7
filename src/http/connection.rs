use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::http::handler::Handler;
use crate::http::parser::{parse_http_request, ParseError, MAX_HEAD_BYTES};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;

const READ_CHUNK: usize = 4096;

pub struct Connection<S, H> {
    stream: S,
    handler: Arc<H>,
    buffer: Vec<u8>,
    max_body: usize,
    state: ConnectionState,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

enum ReadOutcome {
    Request(Request),
    Malformed(ParseError),
    Eof,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler,
{
    pub fn new(stream: S, handler: Arc<H>, max_body: usize) -> Self {
        Self {
            stream,
            handler,
            buffer: Vec::with_capacity(READ_CHUNK),
            max_body,
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await? {
                        ReadOutcome::Request(req) => ConnectionState::Processing(req),
                        ReadOutcome::Malformed(e) => {
                            tracing::debug!(error = %e, "Malformed request");
                            let response = error_response(&e);
                            ConnectionState::Writing(ResponseWriter::new(&close(response)), false)
                        }
                        ReadOutcome::Eof => ConnectionState::Closed,
                    };
                }

                ConnectionState::Processing(req) => {
                    let keep_alive = req.keep_alive();
                    let head_request = req.method == Method::HEAD;

                    let handler = Arc::clone(&self.handler);
                    let handled = tokio::select! {
                        response = handler.handle(req) => Some(response),
                        _ = wait_for_disconnect(&mut self.stream, &mut self.buffer) => None,
                    };

                    let Some(mut response) = handled else {
                        // The in-flight handler future (and any backend call) was dropped.
                        tracing::debug!("Client went away before the response was ready");
                        return Ok(());
                    };

                    if head_request {
                        response.body.clear();
                    }
                    if !keep_alive {
                        response = close(response);
                    }

                    self.state = ConnectionState::Writing(ResponseWriter::new(&response), keep_alive);
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        let limit = MAX_HEAD_BYTES + self.max_body + READ_CHUNK;

        loop {
            // Try parsing whatever we already have
            match parse_http_request(&self.buffer, self.max_body) {
                Ok((request, consumed)) => {
                    self.buffer.drain(..consumed);
                    return Ok(ReadOutcome::Request(request));
                }

                Err(ParseError::Incomplete) => {
                    if self.buffer.len() > limit {
                        return Ok(ReadOutcome::Malformed(ParseError::TooLarge));
                    }
                }

                Err(e) => return Ok(ReadOutcome::Malformed(e)),
            }

            let mut temp = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut temp).await?;

            if n == 0 {
                // Client closed connection
                return Ok(ReadOutcome::Eof);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}

/// Completes once the client closes its side of the connection.
///
/// Pipelined bytes that arrive meanwhile are kept in `buffer` for the next
/// request. Once the buffer is full the client is no longer watched.
async fn wait_for_disconnect<S>(stream: &mut S, buffer: &mut Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let mut temp = [0u8; READ_CHUNK];
    while buffer.len() < MAX_HEAD_BYTES {
        match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buffer.extend_from_slice(&temp[..n]),
        }
    }
    std::future::pending::<()>().await
}

fn error_response(error: &ParseError) -> Response {
    match error {
        ParseError::TooLarge => Response::text(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large"),
        _ => Response::bad_request(),
    }
}

fn close(mut response: Response) -> Response {
    response.headers.insert("Connection", "close");
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, request: Request) -> impl std::future::Future<Output = Response> + Send {
            async move { Response::ok(request.path.into_bytes()) }
        }
    }

    #[tokio::test]
    async fn serves_pipelined_requests_then_closes() {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(async move {
            Connection::new(server, Arc::new(Echo), 1024).run().await
        });

        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();

        let first = text.find("\r\n\r\n/a").unwrap();
        let second = text.find("\r\n\r\n/b").unwrap();
        assert!(first < second);
        assert!(text.contains("Connection: close"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(async move {
            let _ = Connection::new(server, Arc::new(Echo), 1024).run().await;
        });

        client.write_all(b"GET / HTTP/1.1\r\nBroken\r\n\r\n").await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn oversized_body_gets_413() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(async move {
            let _ = Connection::new(server, Arc::new(Echo), 4).run().await;
        });

        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789")
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 413 Payload Too Large\r\n"));
    }
}
