//! A connection wrapper that can peek bytes without consuming them.
//!
//! `peek(n)` pulls bytes from the socket into an internal buffer and hands
//! them back without advancing the read cursor; subsequent reads replay
//! the buffer from offset zero before touching the socket again, so the
//! sniffer, the TLS handshake, and the HTTP parser all observe the stream
//! exactly as the client sent it.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A byte stream with a replayable peek buffer.
#[derive(Debug)]
pub struct PeekStream<S> {
    inner: S,
    buffer: BytesMut,
    pos: usize,
    peer_addr: Option<SocketAddr>,
}

impl<S> PeekStream<S> {
    /// Wraps a stream. `peer_addr` is carried for rate limiting and logs.
    pub fn new(inner: S, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            pos: 0,
            peer_addr,
        }
    }

    /// Wraps a stream together with bytes that were already read from it,
    /// e.g. the unparsed tail of an HTTP head before a WebSocket handoff.
    /// Reads deliver `leftover` first.
    pub fn from_parts(leftover: &[u8], inner: S, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            inner,
            buffer: BytesMut::from(leftover),
            pos: 0,
            peer_addr,
        }
    }

    /// The remote address of the wrapped connection, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Consumes the wrapper, returning the unread buffered bytes and the
    /// underlying stream.
    pub fn into_parts(self) -> (BytesMut, S) {
        let mut buffer = self.buffer;
        let _ = buffer.split_to(self.pos);
        (buffer, self.inner)
    }

    /// Bytes currently buffered and not yet consumed by a read.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Returns up to `n` bytes from the front of the unconsumed stream
    /// without consuming them, reading from the socket as needed.
    ///
    /// Stops filling at end-of-stream or when `deadline` elapses; either
    /// way the bytes gathered so far are returned. Fails only when nothing
    /// at all is available: `TimedOut` when the deadline passed silently,
    /// `UnexpectedEof` when the peer closed without sending.
    pub async fn peek(&mut self, n: usize, deadline: Duration) -> io::Result<&[u8]> {
        let deadline = tokio::time::Instant::now() + deadline;

        let mut timed_out = false;
        while self.buffer.len() - self.pos < n {
            match tokio::time::timeout_at(deadline, self.inner.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let available = &self.buffer[self.pos..];
        if available.is_empty() {
            let kind = if timed_out {
                io::ErrorKind::TimedOut
            } else {
                io::ErrorKind::UnexpectedEof
            };
            return Err(kind.into());
        }

        Ok(&available[..available.len().min(n)])
    }

    /// Pulls at least one more byte from the socket into the peek buffer,
    /// without consuming anything. Returns the number of bytes added, 0 at
    /// end-of-stream, or `TimedOut` when `deadline` elapses first.
    pub async fn fill_more(&mut self, deadline: Duration) -> io::Result<usize> {
        match tokio::time::timeout(deadline, self.inner.read_buf(&mut self.buffer)).await {
            Ok(result) => result,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.buffer.len() {
            let available = &this.buffer[this.pos..];
            let to_copy = available.len().min(buf.remaining());
            buf.put_slice(&available[..to_copy]);
            this.pos += to_copy;

            if this.pos == this.buffer.len() {
                this.buffer.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    const DEADLINE: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn read_after_peek_starts_at_offset_zero() {
        let mut stream = PeekStream::new(Cursor::new(b"hello world".to_vec()), None);

        let peeked = stream.peek(5, DEADLINE).await.unwrap();
        assert_eq!(peeked, b"hello");

        let mut buf = vec![0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn second_peek_extends_the_window() {
        let mut stream = PeekStream::new(Cursor::new(b"abcdefgh".to_vec()), None);

        assert_eq!(stream.peek(2, DEADLINE).await.unwrap(), b"ab");
        assert_eq!(stream.peek(6, DEADLINE).await.unwrap(), b"abcdef");

        let mut buf = vec![0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }

    #[tokio::test]
    async fn short_stream_returns_what_is_available() {
        let mut stream = PeekStream::new(Cursor::new(b"abc".to_vec()), None);
        assert_eq!(stream.peek(64, DEADLINE).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn peek_on_closed_stream_fails() {
        let mut stream = PeekStream::new(Cursor::new(Vec::new()), None);
        let err = stream.peek(4, DEADLINE).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (client, _server) = tokio::io::duplex(16);
        let mut stream = PeekStream::new(client, None);

        let err = stream.peek(4, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn from_parts_replays_leftover_before_the_stream() {
        let mut stream = PeekStream::from_parts(b"head", Cursor::new(b"tail".to_vec()), None);

        let mut buf = vec![0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"headtail");
    }

    #[tokio::test]
    async fn reads_spanning_the_buffer_boundary() {
        let mut stream = PeekStream::new(Cursor::new(b"0123456789".to_vec()), None);
        stream.peek(4, DEADLINE).await.unwrap();

        // First read drains only the buffered prefix.
        let mut buf = vec![0u8; 6];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"0123");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(&rest, b"456789");
    }
}
