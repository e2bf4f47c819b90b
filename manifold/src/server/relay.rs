//! The HTTP/1.1 reverse-proxy loop.
//!
//! One call services a whole client connection: requests are parsed and
//! routed one at a time, each against a freshly dialed backend, with the
//! response relayed back under the request's framing hint. A `101
//! Switching Protocols` response hands both connections to the streamer
//! and ends the loop; otherwise the keep-alive rules decide whether the
//! next request is awaited on the same connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::constants::{BACKEND_DIAL_TIMEOUT, HTTP_IDLE_TIMEOUT};
use crate::error::{RelayError, Result};
use crate::limiter::client_ip;
use crate::metrics::{MeteredStream, Metrics};

use super::http1::{self, BodyFraming, Http1Conn};
use super::peek::PeekStream;
use super::stream;

/// Tracks the per-entry connection gauge for the lifetime of one client
/// connection, no matter which exit path the relay takes.
struct GaugeGuard(Option<Arc<Metrics>>);

impl GaugeGuard {
    fn track(&mut self, metrics: &Arc<Metrics>) {
        if self.0.is_none() {
            metrics.connection_opened();
            self.0 = Some(metrics.clone());
        }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.0 {
            metrics.connection_closed();
        }
    }
}

/// Services an accepted HTTP connection (raw or TLS-terminated) until it
/// closes, upgrades, or fails.
pub async fn relay<S>(
    stream: S,
    peer: Option<SocketAddr>,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = Http1Conn::new(stream);
    let mut gauge = GaugeGuard(None);

    loop {
        // A cancelled context reads the same as a client that went away.
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            head = timeout(HTTP_IDLE_TIMEOUT, client.read_request_head()) => match head {
                Err(_) => return Ok(()),
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(request))) => request,
                Ok(Err(err)) => return Err(err),
            },
        };

        let Some(entry) = request.host().and_then(|host| config.entry(host)) else {
            warn!(host = request.host().unwrap_or(""), "Host not found");
            respond(&mut client, 404, "Not Found", "Host not found").await;
            return Ok(());
        };
        gauge.track(&entry.metrics);

        let ip = client_ip(peer, "");
        if let Some(limiter) = &entry.limiter {
            if !ip.is_some_and(|ip| limiter.allow(ip)) {
                respond(&mut client, 429, "Too Many Requests", "Rate limit exceeded").await;
                return Ok(());
            }
        }

        let route = entry.match_route(request.path());
        if route.matched {
            debug!(
                path = request.path(),
                rewritten = %route.rewritten_path,
                target = %route.target,
                "Route matched"
            );
            if let Some(limiter) = &route.limiter {
                if !ip.is_some_and(|ip| limiter.allow(ip)) {
                    respond(&mut client, 429, "Too Many Requests", "Rate limit exceeded").await;
                    return Ok(());
                }
            }
        }
        // A rewrite that consumed the whole path still needs a request
        // target on the wire.
        let forward_path = if route.rewritten_path.is_empty() {
            "/"
        } else {
            route.rewritten_path.as_str()
        };
        let forward_target = format!("{forward_path}{}", request.query());

        let dialed = Instant::now();
        let backend = match timeout(BACKEND_DIAL_TIMEOUT, TcpStream::connect(&route.target)).await
        {
            Ok(Ok(backend)) => backend,
            Ok(Err(err)) => {
                error!(target = %route.target, %err, "Backend dial failed");
                respond(&mut client, 502, "Bad Gateway", "Bad Gateway").await;
                return Ok(());
            }
            Err(_) => {
                error!(target = %route.target, "Backend dial timed out");
                respond(&mut client, 502, "Bad Gateway", "Bad Gateway").await;
                return Ok(());
            }
        };
        entry.metrics.set_rtt(dialed.elapsed());
        let _ = backend.set_nodelay(true);
        let mut backend = Http1Conn::new(backend);

        // Forward the request, path rewritten, headers untouched.
        let head_bytes = request.encode(&forward_target);
        let request_framing = request.body_framing()?;
        let forwarded = async {
            backend.stream_mut().write_all(&head_bytes).await?;
            let body = client.copy_body(backend.stream_mut(), request_framing).await?;
            backend.stream_mut().flush().await?;
            Ok::<u64, std::io::Error>(body)
        }
        .await;
        match forwarded {
            Ok(body_bytes) => entry
                .metrics
                .add_ingress_bytes(head_bytes.len() as u64 + body_bytes),
            Err(err) => {
                let err = RelayError::BackendWrite(err);
                error!(target = %route.target, %err, "Backend write failed");
                respond(&mut client, 502, "Bad Gateway", "Bad Gateway").await;
                return Ok(());
            }
        }

        let response = match backend.read_response_head().await {
            Ok(response) => response,
            Err(err) => {
                let err = match err {
                    crate::error::ManifoldError::Io(io_err) => {
                        RelayError::BackendRead(io_err).into()
                    }
                    other => other,
                };
                error!(target = %route.target, %err, "Backend read failed");
                respond(&mut client, 502, "Bad Gateway", "Bad Gateway").await;
                return Ok(());
            }
        };

        // Relay the response through the metered writer.
        let response_framing = response.body_framing(&request.method)?;
        let mut metered = MeteredStream::new(client.stream_mut(), entry.metrics.clone());
        let relayed = async {
            metered.write_all(&response.raw).await?;
            backend.copy_body(&mut metered, response_framing).await?;
            metered.flush().await
        }
        .await;
        if let Err(err) = relayed {
            return Err(RelayError::ClientWrite(err).into());
        }

        if response.status == 101 {
            debug!(
                websocket = request.is_websocket_upgrade(),
                target = %route.target,
                "Switching protocols, handing off to the streamer"
            );
            let (client_tail, client_stream) = client.into_parts();
            let (backend_tail, backend_stream) = backend.into_parts();

            let client_side = MeteredStream::new(
                PeekStream::from_parts(&client_tail, client_stream, peer),
                entry.metrics.clone(),
            );
            let backend_side = PeekStream::from_parts(&backend_tail, backend_stream, None);

            return stream::stream(client_side, backend_side, cancel)
                .await
                .map_err(Into::into);
        }

        if response_framing == BodyFraming::ReadToEof
            || !http1::keep_alive(&request, &response)
        {
            return Ok(());
        }
        // Keep-alive: next request dials a fresh backend.
    }
}

/// Writes a canned plain-text error response and gives up on failures; the
/// connection closes either way.
async fn respond<S>(client: &mut Http1Conn<S>, code: u16, reason: &str, message: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = http1::error_response(code, reason, message);
    if let Err(err) = client.stream_mut().write_all(&body).await {
        debug!(%err, code, "Error response could not be written");
    }
    let _ = client.stream_mut().flush().await;
}
