//! HTTP relay errors.

use thiserror::Error;

/// Errors produced by the HTTP/1.1 relay loop.
///
/// These map onto the wire responses the relay sends (404, 429, 502) or
/// onto connection teardown; the message text here is for logs only and is
/// never written to a peer.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The request head could not be parsed as HTTP/1.1
    #[error("Malformed HTTP request")]
    MalformedRequest,

    /// The request head exceeded the maximum buffered size
    #[error("Request head too large ({size} bytes)")]
    HeadTooLarge { size: usize },

    /// The response head from the backend could not be parsed
    #[error("Malformed HTTP response from backend")]
    MalformedResponse,

    /// Writing the request to the backend failed
    #[error("Backend write failed")]
    BackendWrite(#[source] std::io::Error),

    /// Reading the response from the backend failed
    #[error("Backend read failed")]
    BackendRead(#[source] std::io::Error),

    /// Writing the response to the client failed
    #[error("Client write failed")]
    ClientWrite(#[source] std::io::Error),

    /// A request body used a transfer encoding the relay does not frame
    #[error("Unsupported transfer encoding: {encoding}")]
    UnsupportedEncoding { encoding: String },
}
