use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;

/// Upper bound for a request or response head (start line plus headers).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequest,
    #[error("unsupported method")]
    InvalidMethod,
    #[error("malformed header")]
    InvalidHeader,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("invalid status line")]
    InvalidStatus,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("message too large")]
    TooLarge,
    /// More bytes are needed before anything can be decided.
    #[error("incomplete message")]
    Incomplete,
}

/// How the body following a message head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    /// Body runs until the peer closes the connection (responses only).
    UntilClose,
}

/// Status line and headers of a backend response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
}

/// Parses one complete request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, so pipelined
/// requests can stay in the buffer. Bodies larger than `max_body` are
/// rejected with `TooLarge`.
pub fn parse_http_request(buf: &[u8], max_body: usize) -> Result<(Request, usize), ParseError> {
    let headers_end = match find_headers_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEAD_BYTES => return Err(ParseError::TooLarge),
        None => return Err(ParseError::Incomplete),
    };
    let header_bytes = &buf[..headers_end];
    let body_start = headers_end + 4;

    let headers_str = std::str::from_utf8(header_bytes)
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidRequest);
    }
    if path.bytes().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    let mut headers = parse_header_lines(lines)?;

    let (body, consumed) = match request_framing(&headers)? {
        BodyFraming::Length(len) => {
            if len > max_body {
                return Err(ParseError::TooLarge);
            }
            let body_bytes = &buf[body_start..];
            if body_bytes.len() < len {
                return Err(ParseError::Incomplete);
            }
            (body_bytes[..len].to_vec(), body_start + len)
        }
        BodyFraming::Chunked => {
            let (body, used) = decode_chunked(&buf[body_start..], max_body)?;
            // The body is forwarded de-chunked with an explicit length.
            headers.remove("Transfer-Encoding");
            headers.insert("Content-Length", body.len().to_string());
            (body, body_start + used)
        }
        BodyFraming::Empty | BodyFraming::UntilClose => (Vec::new(), body_start),
    };

    let request = Request {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body,
    };

    Ok((request, consumed))
}

/// Parses a response status line and headers from the front of `buf`.
///
/// Returns the head and the offset of the first body byte.
pub fn parse_response_head(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let headers_end = match find_headers_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEAD_BYTES => return Err(ParseError::TooLarge),
        None => return Err(ParseError::Incomplete),
    };

    let head = std::str::from_utf8(&buf[..headers_end])
        .map_err(|_| ParseError::InvalidStatus)?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().ok_or(ParseError::InvalidStatus)?;
    let mut parts = status_line.splitn(3, ' ');

    let version = parts.next().ok_or(ParseError::InvalidStatus)?;
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidStatus);
    }
    let status = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .ok_or(ParseError::InvalidStatus)?;
    let reason = parts.next().unwrap_or("").trim();
    if !reason.bytes().all(is_field_value_byte) {
        return Err(ParseError::InvalidStatus);
    }
    let reason = reason.to_string();

    let headers = parse_header_lines(lines)?;

    Ok((
        ResponseHead {
            version: version.to_string(),
            status,
            reason,
            headers,
        },
        headers_end + 4,
    ))
}

/// Decides how a response body is delimited.
///
/// `head_request` is true when the response answers a HEAD request, which
/// never has a body regardless of its headers.
pub fn response_framing(head: &ResponseHead, head_request: bool) -> Result<BodyFraming, ParseError> {
    if head_request || head.status.is_bodiless() {
        return Ok(BodyFraming::Empty);
    }
    if head.headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(&head.headers)? {
        Some(len) => Ok(BodyFraming::Length(len)),
        None => Ok(BodyFraming::UntilClose),
    }
}

fn request_framing(headers: &Headers) -> Result<BodyFraming, ParseError> {
    if headers.contains("Transfer-Encoding") {
        // Only plain chunked is understood; anything else is refused rather
        // than guessed at.
        return if headers.has_token("Transfer-Encoding", "chunked") {
            Ok(BodyFraming::Chunked)
        } else {
            Err(ParseError::InvalidRequest)
        };
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(len) => Ok(BodyFraming::Length(len)),
    }
}

/// Reads Content-Length, rejecting duplicates that disagree.
fn content_length(headers: &Headers) -> Result<Option<usize>, ParseError> {
    let mut found: Option<usize> = None;
    for value in headers.get_all("Content-Length") {
        let len = value
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        if found.is_some_and(|prev| prev != len) {
            return Err(ParseError::InvalidContentLength);
        }
        found = Some(len);
    }
    Ok(found)
}

/// Decodes a complete chunked body from the front of `buf`.
///
/// Returns the decoded bytes and how many input bytes were consumed,
/// including the terminating chunk and any trailer section. Trailers are
/// discarded.
pub fn decode_chunked(buf: &[u8], max_body: usize) -> Result<(Vec<u8>, usize), ParseError> {
    let mut decoder = ChunkedDecoder::new(max_body);
    let used = decoder.decode(buf)?;
    if !decoder.is_done() {
        return Err(ParseError::Incomplete);
    }
    Ok((decoder.into_body(), used))
}

/// Longest chunk-size line accepted, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Chunked body decoder that keeps its place between reads.
///
/// Each call to [`decode`](ChunkedDecoder::decode) consumes what it can from
/// the front of the input and reports how much; the caller drops those bytes
/// and calls again once more have arrived. Every input byte is looked at once.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    body: Vec<u8>,
    max_body: usize,
}

impl ChunkedDecoder {
    pub fn new(max_body: usize) -> Self {
        Self {
            state: ChunkState::Size,
            body: Vec::new(),
            max_body,
        }
    }

    /// Decodes from the front of `buf` and returns the number of bytes used.
    pub fn decode(&mut self, buf: &[u8]) -> Result<usize, ParseError> {
        let mut pos = 0;

        loop {
            let rest = &buf[pos..];
            match self.state {
                ChunkState::Size => {
                    let Some(line_end) = find_crlf(rest) else {
                        if rest.len() > MAX_CHUNK_LINE {
                            return Err(ParseError::InvalidChunk);
                        }
                        break;
                    };
                    let size_line = std::str::from_utf8(&rest[..line_end])
                        .map_err(|_| ParseError::InvalidChunk)?;
                    let size_hex = size_line.split(';').next().unwrap_or("").trim();
                    let size =
                        usize::from_str_radix(size_hex, 16).map_err(|_| ParseError::InvalidChunk)?;
                    pos += line_end + 2;

                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else if self.body.len().saturating_add(size) > self.max_body {
                        return Err(ParseError::TooLarge);
                    } else {
                        self.body.reserve(size);
                        self.state = ChunkState::Data(size);
                    }
                }

                ChunkState::Data(remaining) => {
                    if rest.is_empty() {
                        break;
                    }
                    let take = remaining.min(rest.len());
                    self.body.extend_from_slice(&rest[..take]);
                    pos += take;
                    self.state = match remaining - take {
                        0 => ChunkState::DataEnd,
                        left => ChunkState::Data(left),
                    };
                }

                ChunkState::DataEnd => {
                    if rest.len() < 2 {
                        break;
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunk);
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }

                // Trailer section ends with an empty line.
                ChunkState::Trailer => {
                    let Some(end) = find_crlf(rest) else {
                        if rest.len() > MAX_HEAD_BYTES {
                            return Err(ParseError::TooLarge);
                        }
                        break;
                    };
                    pos += end + 2;
                    if end == 0 {
                        self.state = ChunkState::Done;
                    }
                }

                ChunkState::Done => break,
            }
        }

        Ok(pos)
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let value = value.trim_matches(|c: char| c == ' ' || c == '\t');
        if key.is_empty()
            || !key.bytes().all(is_token_byte)
            || !value.bytes().all(is_field_value_byte)
        {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value);
    }

    Ok(headers)
}

/// RFC 9110 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Visible characters, spaces, tabs and obs-text. No CR, LF, NUL or other
/// controls, so a value can never end a header line early.
fn is_field_value_byte(b: u8) -> bool {
    b == b'\t' || (b >= 0x20 && b != 0x7f)
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req, 1024).unwrap();

        assert_eq!(parsed.path, "/");
        assert_eq!(parsed.header("host"), Some("example.com"));
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn chunked_with_extension_and_trailer() {
        let body = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\nNEXT";

        let (decoded, used) = decode_chunked(body, 1024).unwrap();

        assert_eq!(decoded, b"Wikipedia");
        assert_eq!(&body[used..], b"NEXT");
    }

    #[test]
    fn chunked_partial_is_incomplete() {
        assert_eq!(
            decode_chunked(b"a\r\nabc", 1024),
            Err(ParseError::Incomplete)
        );
    }

    #[test]
    fn chunked_decoder_resumes_across_reads() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new(1024);
        let mut pending = Vec::new();
        let mut total_used = 0;

        // One byte at a time, dropping whatever the decoder used.
        for &byte in wire.iter() {
            pending.push(byte);
            let used = decoder.decode(&pending).unwrap();
            pending.drain(..used);
            total_used += used;
        }

        assert!(decoder.is_done());
        assert!(pending.is_empty());
        assert_eq!(total_used, wire.len());
        assert_eq!(decoder.into_body(), b"Wikipedia");
    }

    #[test]
    fn chunked_decoder_never_rereads_consumed_data() {
        let mut decoder = ChunkedDecoder::new(1024);

        // The size line and part of the data are used right away.
        assert_eq!(decoder.decode(b"6\r\nabc").unwrap(), 6);
        // Only the new bytes are handed over next time.
        assert_eq!(decoder.decode(b"def\r\n0\r\n\r\n").unwrap(), 10);

        assert!(decoder.is_done());
        assert_eq!(decoder.into_body(), b"abcdef");
    }

    #[test]
    fn chunked_decoder_rejects_endless_size_line() {
        let mut decoder = ChunkedDecoder::new(1024);
        let junk = vec![b'1'; MAX_CHUNK_LINE + 1];

        assert_eq!(decoder.decode(&junk), Err(ParseError::InvalidChunk));
    }
}
