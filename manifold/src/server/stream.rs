//! Bidirectional byte streaming.
//!
//! `stream(a, b)` pumps bytes both ways until one direction ends, then
//! closes both sides. The two directions run concurrently; the first
//! error is reported through a bounded channel and everything after it is
//! discarded. Cancellation unblocks in-flight reads and tears the pair
//! down. Writes are guarded by a per-chunk deadline so a stuck peer
//! cannot pin the proxy; read timeouts merely re-check cancellation and
//! continue.

use std::io;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::constants::{STREAM_BUFFER_SIZE, STREAM_WRITE_GUARD};
use crate::error::Result;

use super::http1::{BodyFraming, Http1Conn};

/// Copies bytes in both directions between `a` and `b` until either
/// direction reaches end-of-stream, errors, or `cancel` fires. Both sides
/// are closed before returning; closing twice is safe. A clean EOF in
/// either direction is a success.
pub async fn stream<A, B>(a: A, b: B, cancel: &CancellationToken) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    // Capacity one: only the first completed direction's verdict counts.
    let (errors, mut first_error) = mpsc::channel::<io::Result<()>>(1);
    // Either direction finishing stops the other.
    let local = cancel.child_token();

    tokio::join!(
        copy_direction(&mut a_read, &mut b_write, &local, &errors),
        copy_direction(&mut b_read, &mut a_write, &local, &errors),
    );

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    drop(errors);
    match first_error.recv().await {
        Some(Err(err)) => Err(err),
        _ => Ok(()),
    }
}

async fn copy_direction<R, W>(
    read: &mut R,
    write: &mut W,
    stop: &CancellationToken,
    errors: &mpsc::Sender<io::Result<()>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];

    let result = loop {
        let n = tokio::select! {
            biased;
            _ = stop.cancelled() => break Ok(()),
            result = read.read(&mut buf) => match result {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                // A timed-out read only ends the stream when we are also
                // being torn down.
                Err(err) if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::WouldBlock =>
                {
                    if stop.is_cancelled() {
                        break Ok(());
                    }
                    continue;
                }
                Err(err) => break Err(err),
            },
        };

        match timeout(STREAM_WRITE_GUARD, write.write_all(&buf[..n])).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => break Err(err),
            Err(_) => break Err(io::Error::new(io::ErrorKind::TimedOut, "write stalled")),
        }
    };

    // Half-close so the peer observes EOF, and stop the sibling.
    let _ = write.shutdown().await;
    stop.cancel();
    let _ = errors.try_send(result);
}

/// One observed HTTP exchange relayed by [`stream_http_inspected`].
#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub start: Instant,
    pub method: String,
    pub path: String,
    pub status: u16,
}

/// Relays HTTP/1.1 between an established client `a` and backend `b`,
/// framing each request/response pair itself and reporting every exchange
/// through `on_exchange`. Ends cleanly when the client closes between
/// requests or an exchange forbids keep-alive. Not used for WebSockets;
/// an upgrade is handed to [`stream`] by the caller before this point.
pub async fn stream_http_inspected<A, B, F>(a: A, b: B, mut on_exchange: F) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(HttpExchange),
{
    let mut client = Http1Conn::new(a);
    let mut backend = Http1Conn::new(b);

    loop {
        let Some(request) = client.read_request_head().await? else {
            break;
        };
        let start = Instant::now();

        backend
            .stream_mut()
            .write_all(&request.encode(&request.target))
            .await?;
        let request_framing = request.body_framing()?;
        client.copy_body(backend.stream_mut(), request_framing).await?;
        backend.stream_mut().flush().await?;

        let response = backend.read_response_head().await?;
        client.stream_mut().write_all(&response.raw).await?;
        let response_framing = response.body_framing(&request.method)?;
        backend.copy_body(client.stream_mut(), response_framing).await?;
        client.stream_mut().flush().await?;

        on_exchange(HttpExchange {
            start,
            method: request.method.clone(),
            path: request.path().to_string(),
            status: response.status,
        });

        if response_framing == BodyFraming::ReadToEof
            || !super::http1::keep_alive(&request, &response)
        {
            break;
        }
    }

    let (_, mut a) = client.into_parts();
    let (_, mut b) = backend.into_parts();
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    Ok(())
}
