//! Manifold: a layer-4/7 multiplexing reverse proxy.
//!
//! One listening socket accepts every connection; the first bytes decide
//! whether it is TLS, HTTP, or opaque TCP. TLS connections are routed by
//! SNI through a reverse-label domain trie and either passed through as
//! ciphertext or terminated locally; HTTP connections are relayed
//! request-by-request with path routing, rewrites, per-IP rate limiting,
//! WebSocket upgrades, and keep-alive.

pub mod config;
pub mod constants;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod server;
pub mod tls;

pub use config::Config;
pub use error::{ManifoldError, Result};
pub use server::Server;
