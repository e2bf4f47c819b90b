//! HTTP/1.1 wire framing.
//!
//! Owns the byte-level work the relay is built on: incremental head
//! parsing over a growable buffer, request re-serialization with a
//! rewritten path, body framing (content-length, chunked, and the
//! HEAD/204/304 special cases), and the canned plain-text error
//! responses. Response heads are forwarded verbatim; only request heads
//! are re-serialized, because the path may have been rewritten.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{HTTP_MAX_HEADERS, HTTP_MAX_HEAD_SIZE};
use crate::error::RelayError;

/// A parsed request head. Headers keep their original name casing and
/// order; the relay writes them back verbatim.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent, path plus optional query
    pub target: String,
    /// 0 for HTTP/1.0, 1 for HTTP/1.1
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
}

/// A parsed response head plus its raw bytes for verbatim forwarding.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub raw: Bytes,
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    None,
    /// Exactly this many bytes
    ContentLength(u64),
    /// Chunked transfer coding
    Chunked,
    /// Body runs until the peer closes; implies `Connection: close`
    ReadToEof,
}

impl RequestHead {
    /// Case-insensitive single header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    /// `Host` without any port suffix.
    pub fn host(&self) -> Option<&str> {
        let host = self.header("host")?;
        Some(host.split(':').next().unwrap_or(host))
    }

    /// The path portion of the target, without the query string.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// The query string including its `?`, or empty.
    pub fn query(&self) -> &str {
        self.target
            .find('?')
            .map_or("", |at| &self.target[at..])
    }

    /// True when any `Connection` token equals `token`.
    pub fn connection_contains(&self, token: &str) -> bool {
        connection_contains(&self.headers, token)
    }

    /// WebSocket upgrade: `Upgrade: websocket` plus a `Connection` header
    /// containing `upgrade`, both case-insensitive.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
            && self.connection_contains("upgrade")
    }

    /// Framing of the request body.
    pub fn body_framing(&self) -> Result<BodyFraming, RelayError> {
        body_framing_from_headers(&self.headers)
    }

    /// Serializes the head with `path` substituted into the request line.
    /// Headers go out exactly as they came in.
    pub fn encode(&self, path: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.headers.len() * 32);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(b" HTTP/1.");
        out.extend_from_slice(self.version_minor.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    pub fn connection_contains(&self, token: &str) -> bool {
        connection_contains(&self.headers, token)
    }

    /// Framing of the response body, using the request as the hint: HEAD
    /// responses and 1xx/204/304 statuses carry none regardless of their
    /// headers, and an unframed body runs to end-of-stream.
    pub fn body_framing(&self, request_method: &str) -> Result<BodyFraming, RelayError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || self.status < 200
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyFraming::None);
        }

        match body_framing_from_headers(&self.headers)? {
            BodyFraming::None => Ok(BodyFraming::ReadToEof),
            framing => Ok(framing),
        }
    }
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn connection_contains(headers: &[(String, String)], token: &str) -> bool {
    header_lookup(headers, "connection").is_some_and(|value| {
        value
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    })
}

fn body_framing_from_headers(headers: &[(String, String)]) -> Result<BodyFraming, RelayError> {
    if let Some(encoding) = header_lookup(headers, "transfer-encoding") {
        let last = encoding
            .split(',')
            .next_back()
            .map(str::trim)
            .unwrap_or(encoding);
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(RelayError::UnsupportedEncoding {
            encoding: encoding.to_string(),
        });
    }

    match header_lookup(headers, "content-length") {
        Some(value) => {
            let length = value
                .trim()
                .parse::<u64>()
                .map_err(|_| RelayError::MalformedRequest)?;
            if length == 0 {
                Ok(BodyFraming::None)
            } else {
                Ok(BodyFraming::ContentLength(length))
            }
        }
        None => Ok(BodyFraming::None),
    }
}

/// Keep-alive decision after an exchange. HTTP/1.0 closes unless the
/// request opted in; HTTP/1.1 closes when either side said so.
pub fn keep_alive(request: &RequestHead, response: &ResponseHead) -> bool {
    if request.version_minor == 0 {
        return request.connection_contains("keep-alive");
    }
    !request.connection_contains("close") && !response.connection_contains("close")
}

/// Renders the relay's plain-text error response.
pub fn error_response(code: u16, reason: &str, message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{message}",
        message.len()
    )
    .into_bytes()
}

/// A byte stream with an HTTP head/body parse buffer in front of it.
///
/// Bytes that arrive past the parsed head stay in the buffer and are
/// drained first by body copies, or handed back through
/// [`Http1Conn::into_parts`] for a connection handoff.
pub struct Http1Conn<S> {
    stream: S,
    buf: BytesMut,
}

impl<S> Http1Conn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(HTTP_MAX_HEAD_SIZE),
        }
    }

    /// Unparsed bytes plus the underlying stream.
    pub fn into_parts(self) -> (BytesMut, S) {
        (self.buf, self.stream)
    }

    /// Write access to the underlying stream, bypassing the parse buffer.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: AsyncRead + Unpin> Http1Conn<S> {
    async fn fill(&mut self) -> io::Result<usize> {
        self.stream.read_buf(&mut self.buf).await
    }

    /// Reads and parses a request head. Returns `Ok(None)` on a clean
    /// end-of-stream before any byte of a new request.
    pub async fn read_request_head(&mut self) -> crate::error::Result<Option<RequestHead>> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; HTTP_MAX_HEADERS];
            let mut request = httparse::Request::new(&mut headers);

            match request.parse(&self.buf) {
                Ok(httparse::Status::Complete(parsed_len)) => {
                    let head = RequestHead {
                        method: request.method.unwrap_or_default().to_string(),
                        target: request.path.unwrap_or_default().to_string(),
                        version_minor: request.version.unwrap_or(1),
                        headers: collect_headers(request.headers),
                    };
                    let _ = self.buf.split_to(parsed_len);
                    return Ok(Some(head));
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() >= HTTP_MAX_HEAD_SIZE {
                        return Err(RelayError::HeadTooLarge {
                            size: self.buf.len(),
                        }
                        .into());
                    }
                    if self.fill().await? == 0 {
                        if self.buf.is_empty() {
                            return Ok(None);
                        }
                        return Err(RelayError::MalformedRequest.into());
                    }
                }
                Err(_) => return Err(RelayError::MalformedRequest.into()),
            }
        }
    }

    /// Reads and parses a response head, keeping its raw bytes for
    /// verbatim forwarding.
    pub async fn read_response_head(&mut self) -> crate::error::Result<ResponseHead> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; HTTP_MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);

            match response.parse(&self.buf) {
                Ok(httparse::Status::Complete(parsed_len)) => {
                    let head = ResponseHead {
                        status: response.code.unwrap_or(0),
                        version_minor: response.version.unwrap_or(1),
                        headers: collect_headers(response.headers),
                        raw: self.buf.split_to(parsed_len).freeze(),
                    };
                    return Ok(head);
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() >= HTTP_MAX_HEAD_SIZE {
                        return Err(RelayError::HeadTooLarge {
                            size: self.buf.len(),
                        }
                        .into());
                    }
                    if self.fill().await? == 0 {
                        return Err(RelayError::MalformedResponse.into());
                    }
                }
                Err(_) => return Err(RelayError::MalformedResponse.into()),
            }
        }
    }

    /// Copies a framed body from this connection into `dst`, returning the
    /// bytes copied. Chunk framing is forwarded verbatim.
    pub async fn copy_body<W: AsyncWrite + Unpin>(
        &mut self,
        dst: &mut W,
        framing: BodyFraming,
    ) -> io::Result<u64> {
        match framing {
            BodyFraming::None => Ok(0),
            BodyFraming::ContentLength(length) => self.copy_exact(dst, length).await,
            BodyFraming::Chunked => self.copy_chunked(dst).await,
            BodyFraming::ReadToEof => self.copy_to_eof(dst).await,
        }
    }

    async fn copy_exact<W: AsyncWrite + Unpin>(
        &mut self,
        dst: &mut W,
        mut remaining: u64,
    ) -> io::Result<u64> {
        let total = remaining;
        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let take = (self.buf.len() as u64).min(remaining) as usize;
            dst.write_all(&self.buf.split_to(take)).await?;
            remaining -= take as u64;
        }
        Ok(total)
    }

    async fn copy_to_eof<W: AsyncWrite + Unpin>(&mut self, dst: &mut W) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Ok(total);
            }
            total += self.buf.len() as u64;
            dst.write_all(&self.buf.split_to(self.buf.len())).await?;
        }
    }

    async fn copy_chunked<W: AsyncWrite + Unpin>(&mut self, dst: &mut W) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            let line = self.read_line().await?;
            let size = parse_chunk_size(&line)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;
            dst.write_all(&line).await?;
            total += line.len() as u64;

            if size == 0 {
                // Trailer section, up to and including the blank line.
                loop {
                    let trailer = self.read_line().await?;
                    dst.write_all(&trailer).await?;
                    total += trailer.len() as u64;
                    if trailer == "\r\n".as_bytes() || trailer == "\n".as_bytes() {
                        return Ok(total);
                    }
                }
            }

            // Chunk data plus its trailing CRLF.
            total += self.copy_exact(dst, size + 2).await?;
        }
    }

    // Returns one line including its terminator.
    async fn read_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(at) = self.buf.iter().position(|&b| b == b'\n') {
                return Ok(self.buf.split_to(at + 1).freeze());
            }
            if self.buf.len() >= HTTP_MAX_HEAD_SIZE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

// Chunk size is hex, optionally followed by extensions after ';'.
fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let line = std::str::from_utf8(line).ok()?.trim_end();
    let size = line.split(';').next()?.trim();
    u64::from_str_radix(size, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn parse_request(bytes: &[u8]) -> RequestHead {
        let mut conn = Http1Conn::new(Cursor::new(bytes.to_vec()));
        conn.read_request_head().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn parses_a_request_head() {
        let head = parse_request(
            b"GET /api/users?limit=5 HTTP/1.1\r\nHost: app.com:8443\r\nX-Trace: abc\r\n\r\n",
        )
        .await;

        assert_eq!(head.method, "GET");
        assert_eq!(head.path(), "/api/users");
        assert_eq!(head.query(), "?limit=5");
        assert_eq!(head.host(), Some("app.com"));
        assert_eq!(head.header("x-trace"), Some("abc"));
        assert_eq!(head.version_minor, 1);
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let mut conn = Http1Conn::new(Cursor::new(Vec::new()));
        assert!(conn.read_request_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_head_is_malformed() {
        let mut conn = Http1Conn::new(Cursor::new(b"GET / HTTP/1.1\r\nHost".to_vec()));
        assert!(conn.read_request_head().await.is_err());
    }

    #[tokio::test]
    async fn encode_substitutes_the_path_and_keeps_headers() {
        let head = parse_request(b"GET /api/users HTTP/1.1\r\nHost: app.com\r\nX-Case: Kept\r\n\r\n")
            .await;

        let encoded = head.encode("/users");
        assert_eq!(
            encoded,
            b"GET /users HTTP/1.1\r\nHost: app.com\r\nX-Case: Kept\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn websocket_upgrade_detection() {
        let head = parse_request(
            b"GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\r\n",
        )
        .await;
        assert!(head.is_websocket_upgrade());

        let head = parse_request(b"GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\n\r\n").await;
        assert!(!head.is_websocket_upgrade());
    }

    #[tokio::test]
    async fn body_bytes_after_the_head_stay_buffered() {
        let mut conn = Http1Conn::new(Cursor::new(
            b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbodyEXTRA".to_vec(),
        ));
        let head = conn.read_request_head().await.unwrap().unwrap();
        assert_eq!(head.body_framing().unwrap(), BodyFraming::ContentLength(4));

        let mut out = Vec::new();
        let copied = conn
            .copy_body(&mut out, BodyFraming::ContentLength(4))
            .await
            .unwrap();
        assert_eq!(copied, 4);
        assert_eq!(&out, b"body");

        let (leftover, _) = conn.into_parts();
        assert_eq!(&leftover[..], b"EXTRA");
    }

    #[tokio::test]
    async fn chunked_body_is_forwarded_verbatim() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut conn = Http1Conn::new(Cursor::new(body.to_vec()));

        let mut out = Vec::new();
        let copied = conn.copy_body(&mut out, BodyFraming::Chunked).await.unwrap();
        assert_eq!(out, body);
        assert_eq!(copied, body.len() as u64);
    }

    #[tokio::test]
    async fn chunked_trailers_are_forwarded() {
        let body = b"1\r\nx\r\n0\r\nExpires: never\r\n\r\n";
        let mut conn = Http1Conn::new(Cursor::new(body.to_vec()));

        let mut out = Vec::new();
        conn.copy_body(&mut out, BodyFraming::Chunked).await.unwrap();
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn response_head_keeps_raw_bytes() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut conn = Http1Conn::new(Cursor::new(raw.to_vec()));

        let head = conn.read_response_head().await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(&head.raw[..], &raw[..raw.len() - 5]);
        assert_eq!(
            head.body_framing("GET").unwrap(),
            BodyFraming::ContentLength(5)
        );
    }

    #[tokio::test]
    async fn head_and_no_content_responses_have_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        let mut conn = Http1Conn::new(Cursor::new(raw.to_vec()));
        let head = conn.read_response_head().await.unwrap();
        assert_eq!(head.body_framing("HEAD").unwrap(), BodyFraming::None);

        let raw = b"HTTP/1.1 304 Not Modified\r\n\r\n";
        let mut conn = Http1Conn::new(Cursor::new(raw.to_vec()));
        let head = conn.read_response_head().await.unwrap();
        assert_eq!(head.body_framing("GET").unwrap(), BodyFraming::None);
    }

    #[tokio::test]
    async fn unframed_response_body_runs_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nstream until the end";
        let mut conn = Http1Conn::new(Cursor::new(raw.to_vec()));
        let head = conn.read_response_head().await.unwrap();
        assert_eq!(head.body_framing("GET").unwrap(), BodyFraming::ReadToEof);

        let mut out = Vec::new();
        conn.copy_body(&mut out, BodyFraming::ReadToEof).await.unwrap();
        assert_eq!(&out, b"stream until the end");
    }

    #[test]
    fn keep_alive_rules() {
        let request = |minor: u8, connection: Option<&str>| RequestHead {
            method: "GET".into(),
            target: "/".into(),
            version_minor: minor,
            headers: connection
                .map(|c| vec![("Connection".to_string(), c.to_string())])
                .unwrap_or_default(),
        };
        let response = |connection: Option<&str>| ResponseHead {
            status: 200,
            version_minor: 1,
            headers: connection
                .map(|c| vec![("Connection".to_string(), c.to_string())])
                .unwrap_or_default(),
            raw: Bytes::new(),
        };

        // HTTP/1.1 defaults to keep-alive.
        assert!(keep_alive(&request(1, None), &response(None)));
        assert!(!keep_alive(&request(1, Some("close")), &response(None)));
        assert!(!keep_alive(&request(1, None), &response(Some("close"))));

        // HTTP/1.0 requires an explicit opt-in.
        assert!(!keep_alive(&request(0, None), &response(None)));
        assert!(keep_alive(&request(0, Some("keep-alive")), &response(None)));
    }

    #[test]
    fn error_response_is_byte_exact() {
        let bytes = error_response(404, "Not Found", "Host not found");
        assert_eq!(
            bytes,
            b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 14\r\nConnection: close\r\n\r\nHost not found".to_vec()
        );
    }

    #[test]
    fn unsupported_transfer_encoding_is_rejected() {
        let framing = body_framing_from_headers(&[(
            "Transfer-Encoding".to_string(),
            "gzip".to_string(),
        )]);
        assert!(framing.is_err());

        let framing = body_framing_from_headers(&[(
            "Transfer-Encoding".to_string(),
            "gzip, chunked".to_string(),
        )]);
        assert_eq!(framing.unwrap(), BodyFraming::Chunked);
    }
}
