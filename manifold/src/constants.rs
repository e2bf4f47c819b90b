//! Protocol constants for the Manifold proxy.
//!
//! These constants define sniffing windows, wire deadlines, and buffer
//! sizes used throughout the connection pipeline.

use std::sync::LazyLock;
use std::time::Duration;

/// Upper bound on bytes peeked for protocol classification.
pub const SNIFF_MAX_PEEK: usize = 512;

/// Deadline for the classification peek. A connection that sends nothing
/// within this window is treated as opaque TCP.
pub const SNIFF_DEADLINE: Duration = Duration::from_secs(1);

/// Deadline for a client TLS handshake after a connection is classified.
pub const TLS_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Largest TLS record body accepted by the sniffer.
pub const MAX_TLS_RECORD_SIZE: usize = 16384;

/// Copy buffer size for bidirectional streaming.
pub const STREAM_BUFFER_SIZE: usize = 32 * 1024;

/// Per-chunk write guard applied by the streamer when no deadline is set.
pub const STREAM_WRITE_GUARD: Duration = Duration::from_secs(5);

/// Maximum buffered size of an HTTP request or response head.
pub const HTTP_MAX_HEAD_SIZE: usize = 8 * 1024;

/// Maximum number of headers parsed from a single HTTP head.
pub const HTTP_MAX_HEADERS: usize = 64;

/// Idle wait for the start of the next request on a keep-alive connection.
pub const HTTP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for dialing a backend.
pub const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between rate-limiter eviction sweeps.
pub const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Age after which an idle rate-limiter bucket is evicted.
pub const LIMITER_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// ALPN protocols offered on terminated TLS connections.
pub static TLS_ALPN_PROTOCOLS: LazyLock<Vec<Vec<u8>>> = LazyLock::new(|| {
    vec![
        b"h2".to_vec(),       // HTTP/2 on the client side only
        b"http/1.1".to_vec(), // HTTP/1.1
    ]
});
