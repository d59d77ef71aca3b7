use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::response::Response;

const HTTP_VERSION: &str = "HTTP/1.1";

fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + resp.body.len());

    // Status line
    let reason = resp
        .reason
        .as_deref()
        .unwrap_or_else(|| resp.status.reason_phrase());
    let status_line = format!("{} {} {}\r\n", HTTP_VERSION, resp.status.as_u16(), reason);
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in resp.headers.iter() {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    // Body
    buf.extend_from_slice(&resp.body);

    buf
}

pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl ResponseWriter {
    pub fn new(response: &Response) -> Self {
        Self {
            buffer: serialize_response(response),
            written: 0,
        }
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.buffer.len() {
            let n = stream.write(&self.buffer[self.written..]).await?;

            if n == 0 {
                return Err(anyhow::anyhow!("connection closed while writing"));
            }

            self.written += n;
        }

        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::{ResponseBuilder, StatusCode};

    #[test]
    fn backend_reason_phrase_is_kept() {
        let response = ResponseBuilder::new(StatusCode::from_u16(299).unwrap())
            .reason("Custom Thing")
            .build();

        let bytes = serialize_response(&response);

        assert!(bytes.starts_with(b"HTTP/1.1 299 Custom Thing\r\n"));
    }

    #[tokio::test]
    async fn writes_whole_response() {
        let response = Response::unauthorized("Missing Token");
        let mut out: Vec<u8> = Vec::new();

        ResponseWriter::new(&response)
            .write_to_stream(&mut out)
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(text.ends_with("\r\n\r\nMissing Token"));
    }
}
