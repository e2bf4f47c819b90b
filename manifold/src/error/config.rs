//! Configuration loading and validation errors.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
///
/// Covers errors in configuration file parsing, validation, and environment
/// variable processing. File paths may be included for debugging purposes.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Invalid value for configuration field
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// A proxy entry has no upstream target
    #[error("Empty target for domain '{domain}'")]
    EmptyTarget { domain: String },

    /// A route within a proxy entry has no upstream target
    #[error("Empty target for route '{pattern}' in domain '{domain}'")]
    EmptyRouteTarget { pattern: String, domain: String },

    /// A rewrite rule's `from` pattern does not compile
    #[error("Invalid regex '{pattern}' in rewrite rule for domain '{domain}': {reason}")]
    InvalidRewriteRegex {
        pattern: String,
        domain: String,
        reason: String,
    },

    /// YAML deserialization error
    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}
