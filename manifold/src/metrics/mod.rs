//! Byte and connection accounting.
//!
//! `Metrics` holds word-size atomic counters for ingress/egress bytes and
//! connection counts, at process scope or attached to a single proxy
//! entry. `MeteredStream` wraps a byte stream and accounts every strictly
//! positive read and write against a `Metrics` handle without altering
//! error semantics. Nothing here allocates on the hot path.

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Ingress/egress and connection metrics.
#[derive(Debug)]
pub struct Metrics {
    ingress_bytes: AtomicU64,
    egress_bytes: AtomicU64,
    connection_count: AtomicU64,
    active_connections: AtomicI64,
    rtt_micros: AtomicU32,
    start_time: Instant,
    // Last reported values, for delta reporting.
    last_ingress_bytes: AtomicU64,
    last_egress_bytes: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a new metrics instance with the start time set to now.
    pub fn new() -> Self {
        Self {
            ingress_bytes: AtomicU64::new(0),
            egress_bytes: AtomicU64::new(0),
            connection_count: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            rtt_micros: AtomicU32::new(0),
            start_time: Instant::now(),
            last_ingress_bytes: AtomicU64::new(0),
            last_egress_bytes: AtomicU64::new(0),
        }
    }

    /// Atomically adds bytes to the ingress counter.
    pub fn add_ingress_bytes(&self, bytes: u64) {
        self.ingress_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Atomically adds bytes to the egress counter.
    pub fn add_egress_bytes(&self, bytes: u64) {
        self.egress_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a new connection: bumps the total count and the active gauge.
    pub fn connection_opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the end of a connection on the active gauge.
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn ingress_bytes(&self) -> u64 {
        self.ingress_bytes.load(Ordering::Relaxed)
    }

    pub fn egress_bytes(&self) -> u64 {
        self.egress_bytes.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Returns ingress bytes accumulated since the previous delta call and
    /// updates the snapshot.
    pub fn ingress_delta(&self) -> u64 {
        let current = self.ingress_bytes.load(Ordering::Relaxed);
        let last = self.last_ingress_bytes.swap(current, Ordering::Relaxed);
        current - last
    }

    /// Returns egress bytes accumulated since the previous delta call and
    /// updates the snapshot.
    pub fn egress_delta(&self) -> u64 {
        let current = self.egress_bytes.load(Ordering::Relaxed);
        let last = self.last_egress_bytes.swap(current, Ordering::Relaxed);
        current - last
    }

    /// Sets the round-trip estimate, in microseconds.
    pub fn set_rtt(&self, rtt: Duration) {
        self.rtt_micros
            .store(rtt.as_micros().min(u32::MAX as u128) as u32, Ordering::Relaxed);
    }

    /// Returns the round-trip estimate.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_micros.load(Ordering::Relaxed) as u64)
    }

    /// Duration since this metrics instance was created.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average ingress rate in bytes per second over the whole uptime.
    pub fn ingress_rate(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.ingress_bytes() as f64 / secs
    }

    /// Average egress rate in bytes per second over the whole uptime.
    pub fn egress_rate(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.egress_bytes() as f64 / secs
    }
}

/// A byte stream that accounts reads as ingress and writes as egress.
///
/// Counters move by the byte count the underlying stream actually
/// reports; zero-length results and errors leave them untouched.
pub struct MeteredStream<S> {
    inner: S,
    metrics: Arc<Metrics>,
}

impl<S> MeteredStream<S> {
    /// Wraps `inner`, accounting against `metrics`.
    pub fn new(inner: S, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }

    /// Returns the underlying stream, dropping the accounting wrapper.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.metrics.add_ingress_bytes(n as u64);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                self.metrics.add_egress_bytes(*n as u64);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
