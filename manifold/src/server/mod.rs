//! The Manifold server: accept loop and per-connection dispatch.
//!
//! Every accepted socket is wrapped in a [`PeekStream`], classified by the
//! [`sniff`](sniff::sniff) module, and routed down one of four branches:
//! TLS pass-through (SNI extracted from the ClientHello, ciphertext
//! forwarded untouched), TLS termination (local BoringSSL handshake, then
//! HTTP relaying or plaintext streaming), raw HTTP relaying, or opaque
//! TCP, which is closed because no default stream target is configured.

pub mod http1;
pub mod peek;
pub mod relay;
pub mod sniff;
pub mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ProxyEntry, TerminatedProto};
use crate::constants::{
    BACKEND_DIAL_TIMEOUT, LIMITER_MAX_AGE, LIMITER_SWEEP_INTERVAL, SNIFF_DEADLINE,
    TLS_HANDSHAKE_DEADLINE,
};
use crate::error::{ManifoldError, NetworkError, Result};
use crate::metrics::{MeteredStream, Metrics};
use crate::tls::{detect, CertificateSource};

use self::peek::PeekStream;
use self::sniff::Protocol;

/// The listening proxy server.
pub struct Server {
    config: Arc<Config>,
    certs: Arc<dyn CertificateSource>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Server {
    /// Creates a server and registers the configured domains with the
    /// certificate source.
    pub fn new(config: Config, certs: Arc<dyn CertificateSource>) -> Result<Self> {
        certs.manage(&config.domains())?;

        Ok(Self {
            config: Arc::new(config),
            certs,
            metrics: Arc::new(Metrics::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// The token that stops the accept loop and tears down connections.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process-wide metrics.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The loaded configuration.
    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    /// Binds `addr` and serves until cancelled.
    pub async fn run(self: Arc<Self>, addr: &str) -> Result<()> {
        // ":443" style addresses bind the wildcard interface.
        let addr = match addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => addr.to_string(),
        };
        let listener = TcpListener::bind(&addr).await.map_err(|_| {
            ManifoldError::from(NetworkError::BindFailed {
                address: addr.clone(),
            })
        })?;

        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Proxy listening");

        let mut connection_tasks = FuturesUnordered::new();
        let mut sweep = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, peer) = match accept_result {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(%err, "Failed to accept connection");
                            continue;
                        }
                    };

                    info!(peer = %peer, "Connection accepted");
                    let server = Arc::clone(&self);
                    connection_tasks.push(tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream, peer).await {
                            debug!(peer = %peer, %err, "Connection ended with error");
                        }
                    }));
                }

                _ = sweep.tick() => self.sweep_limiters(),

                Some(result) = connection_tasks.next() => {
                    if let Err(err) = result {
                        warn!(%err, "Connection task failed");
                    }
                }

                _ = self.cancel.cancelled() => {
                    info!("Shutdown requested, closing listener");
                    while let Some(result) = connection_tasks.next().await {
                        if let Err(err) = result {
                            warn!(%err, "Connection task failed during shutdown");
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Classifies one connection and runs the matching branch.
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        self.metrics.connection_opened();

        let mut peeked = PeekStream::new(stream, Some(peer));
        let result = match sniff::sniff(&mut peeked).await {
            Protocol::Http => {
                debug!(peer = %peer, "HTTP connection");
                relay::relay(peeked, Some(peer), &self.config, &self.cancel).await
            }
            Protocol::Tls => self.handle_tls(peeked, peer).await,
            Protocol::Tcp => {
                // No default stream target is configured; opaque TCP has
                // nowhere to go.
                debug!(peer = %peer, "Opaque TCP connection, closing");
                Ok(())
            }
        };

        self.metrics.connection_closed();
        info!(peer = %peer, "Connection closed");
        result
    }

    /// The TLS branch: SNI routing from the ClientHello, then either
    /// ciphertext pass-through or local termination.
    async fn handle_tls(&self, mut client: PeekStream<TcpStream>, peer: SocketAddr) -> Result<()> {
        // The sniffer validated the record header; peek the whole record
        // so the ClientHello parses completely.
        let header = client.peek(5, SNIFF_DEADLINE).await?;
        let record_len = detect::record_len(header).unwrap_or(5);
        let record = client.peek(record_len, SNIFF_DEADLINE).await?;

        let hello = match detect::parse_client_hello(record) {
            Ok(Some(hello)) => hello,
            Ok(None) => {
                debug!(peer = %peer, "ClientHello truncated, closing");
                return Ok(());
            }
            Err(err) => {
                debug!(peer = %peer, %err, "Not a ClientHello, closing");
                return Ok(());
            }
        };

        let Some(sni) = hello.sni else {
            debug!(peer = %peer, "ClientHello without SNI, closing");
            return Ok(());
        };

        let Some(entry) = self.config.entry(&sni) else {
            debug!(peer = %peer, %sni, "No proxy for SNI, closing");
            return Err(NetworkError::HostNotConfigured { host: sni }.into());
        };

        if let Some(limiter) = &entry.limiter {
            if !limiter.allow(peer.ip()) {
                debug!(peer = %peer, %sni, "Rate limit exceeded, closing");
                return Err(NetworkError::RateLimitExceeded {
                    ip: peer.ip().to_string(),
                }
                .into());
            }
        }

        entry.metrics.connection_opened();
        let result = if entry.terminate {
            self.terminate_tls(client, peer, &sni, &entry).await
        } else {
            self.pass_through(client, peer, &sni, &entry).await
        };
        entry.metrics.connection_closed();
        result
    }

    /// Forwards the ciphertext, ClientHello included, to the backend. The
    /// proxy never sees plaintext on this branch.
    async fn pass_through(
        &self,
        client: PeekStream<TcpStream>,
        peer: SocketAddr,
        sni: &str,
        entry: &ProxyEntry,
    ) -> Result<()> {
        debug!(peer = %peer, %sni, target = %entry.target, "TLS pass-through");

        let backend = dial(&entry.target).await?;
        let metered = MeteredStream::new(client, entry.metrics.clone());
        stream::stream(metered, backend, &self.cancel)
            .await
            .map_err(Into::into)
    }

    /// Performs the local handshake and relays the plaintext according to
    /// the entry's protocol tag.
    async fn terminate_tls(
        &self,
        client: PeekStream<TcpStream>,
        peer: SocketAddr,
        sni: &str,
        entry: &ProxyEntry,
    ) -> Result<()> {
        let handshake = timeout(
            TLS_HANDSHAKE_DEADLINE,
            tokio_boring::accept(self.certs.acceptor(), client),
        )
        .await;

        let tls = match handshake {
            Ok(Ok(tls)) => tls,
            Ok(Err(err)) => {
                debug!(peer = %peer, %sni, %err, "TLS handshake failed");
                return Ok(());
            }
            Err(_) => {
                debug!(peer = %peer, %sni, "TLS handshake timed out");
                return Ok(());
            }
        };

        let alpn = tls
            .ssl()
            .selected_alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned());
        debug!(peer = %peer, %sni, alpn = alpn.as_deref().unwrap_or("none"), "TLS terminated");

        match entry.proto {
            TerminatedProto::Http => {
                relay::relay(tls, Some(peer), &self.config, &self.cancel).await
            }
            TerminatedProto::Stream => {
                let backend = dial(&entry.target).await?;
                let metered = MeteredStream::new(tls, entry.metrics.clone());
                stream::stream(metered, backend, &self.cancel)
                    .await
                    .map_err(Into::into)
            }
        }
    }

    /// Evicts stale rate-limiter buckets across every entry and route.
    fn sweep_limiters(&self) {
        for domain in self.config.domains() {
            let Some(entry) = self.config.entry(&domain) else {
                continue;
            };
            if let Some(limiter) = &entry.limiter {
                limiter.cleanup(LIMITER_MAX_AGE);
            }
            for route in entry.routes() {
                if let Some(limiter) = &route.limiter {
                    limiter.cleanup(LIMITER_MAX_AGE);
                }
            }
        }
    }
}

/// Dials a backend with the standard deadline.
async fn dial(target: &str) -> Result<TcpStream> {
    let stream = timeout(BACKEND_DIAL_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| NetworkError::DialFailed {
            address: target.to_string(),
        })?
        .map_err(|_| NetworkError::DialFailed {
            address: target.to_string(),
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
