//! Network communication and socket errors.

use thiserror::Error;

/// Network communication and protocol errors.
///
/// Encompasses connection failures between the proxy, its clients, and its
/// backends, plus listener lifecycle errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Backend dial failed
    #[error("Dial failed to {address}")]
    DialFailed { address: String },

    /// Listener binding failed
    #[error("Bind failed: {address}")]
    BindFailed { address: String },

    /// No proxy entry configured for the requested host or SNI
    #[error("No proxy configured for host '{host}'")]
    HostNotConfigured { host: String },

    /// The per-IP rate limit denied the connection
    #[error("Rate limit exceeded for {ip}")]
    RateLimitExceeded { ip: String },
}
