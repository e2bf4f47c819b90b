//! YAML document types for the proxy configuration.
//!
//! These structs mirror the on-disk schema one-to-one; they are turned
//! into runtime [`ProxyEntry`](super::ProxyEntry) values (compiled rewrite
//! regexes, constructed limiters, sorted routes) by the loader.

use std::collections::HashMap;

use serde::Deserialize;

use super::defaults::*;

/// Top-level configuration document.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Document {
    /// Domain pattern to proxy definitions. Keys may use `*` as any single
    /// label, e.g. `*.app.com`.
    #[serde(default)]
    pub proxies: HashMap<String, ProxyDoc>,
    /// Logging configuration
    #[serde(default)]
    pub log: LogDoc,
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LogDoc {
    /// The log level to use (default = info)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogDoc {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A single domain's proxy definition.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ProxyDoc {
    /// Default upstream target as `host:port`
    pub target: String,
    /// Terminate TLS locally instead of passing ciphertext through
    #[serde(default)]
    pub terminate: bool,
    /// What terminated plaintext carries; required when `terminate` is set
    #[serde(default)]
    pub proto: Option<TerminatedProto>,
    /// Per-domain rate limit
    #[serde(default)]
    pub rate_limit: Option<LimiterDoc>,
    /// Path-based routes, matched longest pattern first
    #[serde(default)]
    pub routes: Vec<RouteDoc>,
}

/// Protocol carried by a locally terminated connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminatedProto {
    /// HTTP/1.1 relaying with routing and rewrites
    #[default]
    Http,
    /// Opaque plaintext forwarding to the default target
    Stream,
}

/// A path route within a proxy definition.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RouteDoc {
    /// Path pattern, optionally ending in `/*`
    pub pattern: String,
    /// Upstream target for this route as `host:port`
    pub target: String,
    /// Optional path rewrite applied after the match
    #[serde(default)]
    pub rewrite: Option<RewriteDoc>,
    /// Per-route rate limit, applied after the path match
    #[serde(default)]
    pub rate_limit: Option<LimiterDoc>,
}

/// A path rewrite rule.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RewriteDoc {
    /// Regex matched against the path
    pub from: String,
    /// Replacement template; supports `$1`-style backreferences
    pub to: String,
}

/// Rate limit settings. Omitted keys fall back to rate 10, burst 10,
/// cooldown 5 minutes.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LimiterDoc {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: u32,
    /// Bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Penalty after a deny, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown: u64,
}

impl Default for LimiterDoc {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            burst: default_burst(),
            cooldown: default_cooldown_ms(),
        }
    }
}
