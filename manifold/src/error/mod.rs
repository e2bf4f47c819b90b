//! Error handling for the Manifold proxy.
//!
//! This module provides a hierarchical error system using `thiserror` that
//! covers configuration, networking, certificates, and the HTTP relay.
//! Error messages are designed to be informative for operators while never
//! leaking internal detail onto the wire.

mod certificate;
mod config;
mod network;
mod relay;

pub use certificate::CertificateError;
pub use config::ConfigError;
pub use network::NetworkError;
pub use relay::RelayError;

use thiserror::Error;

/// Main error type for the Manifold proxy.
///
/// This enum represents all possible errors that can occur within Manifold,
/// organized by functional domains. Each variant maps to specific module
/// errors while maintaining a consistent interface for error handling
/// throughout the application.
#[derive(Error, Debug)]
pub enum ManifoldError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Certificate and TLS-related errors
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// HTTP relay errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// I/O operations errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic system errors for unrecoverable conditions
    #[error("System error: {message}")]
    System { message: String },
}

// BoringSSL error conversion
impl From<boring::ssl::Error> for ManifoldError {
    fn from(_err: boring::ssl::Error) -> Self {
        ManifoldError::Certificate(CertificateError::HandshakeFailed)
    }
}

impl From<boring::error::ErrorStack> for ManifoldError {
    fn from(err: boring::error::ErrorStack) -> Self {
        ManifoldError::Certificate(CertificateError::Ssl {
            message: err.to_string(),
        })
    }
}

impl From<tokio::task::JoinError> for ManifoldError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ManifoldError::system("Task was cancelled")
        } else if err.is_panic() {
            ManifoldError::system("Task panicked")
        } else {
            ManifoldError::system(format!("Task failed: {err}"))
        }
    }
}

impl From<tracing::subscriber::SetGlobalDefaultError> for ManifoldError {
    fn from(err: tracing::subscriber::SetGlobalDefaultError) -> Self {
        ManifoldError::system(format!("Failed to set global tracing subscriber: {err}"))
    }
}

impl From<figment::Error> for ManifoldError {
    fn from(err: figment::Error) -> Self {
        let config_error = if err.path.is_empty() {
            ConfigError::ParseError {
                message: err.to_string(),
            }
        } else {
            let field = err.path.join(".");
            match err.kind {
                figment::error::Kind::MissingField(name) => ConfigError::MissingField {
                    field: name.to_string(),
                },
                _ => ConfigError::InvalidValue {
                    field,
                    reason: err.kind.to_string(),
                },
            }
        };
        ManifoldError::Config(config_error)
    }
}

impl ManifoldError {
    /// Creates a new ManifoldError with a system message.
    pub fn system(message: impl Into<String>) -> Self {
        ManifoldError::System {
            message: message.into(),
        }
    }

    /// Creates a ManifoldError for a general configuration error.
    pub fn config_error(message: impl Into<String>) -> Self {
        ManifoldError::Config(ConfigError::ParseError {
            message: message.into(),
        })
    }
}

/// Result type alias for Manifold operations.
pub type Result<T> = std::result::Result<T, ManifoldError>;
