//! Certificate and TLS operation errors.

use thiserror::Error;

/// Certificate and TLS operation errors.
///
/// Handles certificate loading, acceptor construction, and handshake
/// failures. Certificate details are not exposed to prevent information
/// leakage.
#[derive(Error, Debug)]
pub enum CertificateError {
    /// Certificate file could not be loaded
    #[error("Certificate loading failed: {path}")]
    LoadFailed { path: std::path::PathBuf },

    /// Private key file could not be loaded
    #[error("Private key loading failed: {path}")]
    PrivateKeyLoadFailed { path: std::path::PathBuf },

    /// TLS handshake with the client failed
    #[error("TLS handshake failed")]
    HandshakeFailed,

    /// Underlying SSL library error
    #[error("SSL error: {message}")]
    Ssl { message: String },
}
