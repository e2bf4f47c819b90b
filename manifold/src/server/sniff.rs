//! Wire protocol classification.
//!
//! Inspects the first bytes of a connection through the peek buffer and
//! decides whether the client is speaking TLS, HTTP/1.x (or HTTP/2 with
//! prior knowledge), or something opaque. The stream itself is never
//! consumed; whichever branch wins sees the bytes from offset zero.

use tokio::io::AsyncRead;

use crate::constants::{MAX_TLS_RECORD_SIZE, SNIFF_DEADLINE, SNIFF_MAX_PEEK};

use super::peek::PeekStream;

/// The classified wire protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TLS handshake record
    Tls,
    /// HTTP/1.x request, or HTTP/2 with prior knowledge
    Http,
    /// Anything else; forwarded or dropped opaquely
    Tcp,
}

/// Outcome of classifying a (possibly still growing) peek window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Tls,
    Http,
    Tcp,
    /// Not classifiable yet; a larger window may decide
    NeedMore,
}

const HTTP_METHODS: &[&str] = &[
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "TRACE ", "CONNECT ",
];

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0";

/// Classifies the connection by peeking at its first bytes.
///
/// Classification is attempted as bytes arrive, so a request that fits in
/// the first segment is decided immediately. An inconclusive window (a
/// matched method still waiting for its version token, or too few bytes
/// to decide) grows up to 512 bytes before defaulting to TCP; a peer that
/// goes silent past the peek deadline is opaque TCP as well.
pub async fn sniff<S: AsyncRead + Unpin>(stream: &mut PeekStream<S>) -> Protocol {
    let start = tokio::time::Instant::now();

    loop {
        match classify(stream.buffered()) {
            Verdict::Tls => return Protocol::Tls,
            Verdict::Http => return Protocol::Http,
            Verdict::Tcp => return Protocol::Tcp,
            Verdict::NeedMore => {}
        }

        // The widened window is as far as we look.
        if stream.buffered().len() >= SNIFF_MAX_PEEK {
            return Protocol::Tcp;
        }

        let remaining = SNIFF_DEADLINE.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Protocol::Tcp;
        }
        match stream.fill_more(remaining).await {
            Ok(0) | Err(_) => return Protocol::Tcp,
            Ok(_) => {}
        }
    }
}

fn classify(buf: &[u8]) -> Verdict {
    if buf.len() < 5 {
        return Verdict::NeedMore;
    }

    if is_tls_record(buf) {
        return Verdict::Tls;
    }

    if buf.len() < 14 {
        return Verdict::NeedMore;
    }

    if buf.starts_with(HTTP2_PREFACE) {
        return Verdict::Http;
    }

    let upper = buf.to_ascii_uppercase();
    for method in HTTP_METHODS {
        if upper.starts_with(method.as_bytes()) {
            if contains(&upper, b"HTTP/1.") || contains(&upper, b"HTTP/2") {
                return Verdict::Http;
            }
            // Method line present but the version token has not arrived.
            return Verdict::NeedMore;
        }
    }

    Verdict::Tcp
}

/// A TLS handshake record: type 0x16, major version 3, minor at most 4,
/// and a plausible record length.
fn is_tls_record(buf: &[u8]) -> bool {
    if buf.len() < 5 {
        return false;
    }
    if buf[0] != 0x16 || buf[1] != 0x03 || buf[2] > 0x04 {
        return false;
    }
    let length = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    length > 0 && length <= MAX_TLS_RECORD_SIZE
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
