//! Runtime proxy entries and path routing.
//!
//! A [`ProxyEntry`] is the compiled form of one domain's configuration:
//! upstream target, termination mode, sorted route list with cached
//! rewrite regexes, optional rate limiter, and a metrics handle. Entries
//! are immutable once published into the domain trie; reload replaces the
//! whole `Arc`.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::limiter::RateLimiter;
use crate::metrics::Metrics;

use super::document::{LimiterDoc, TerminatedProto};

/// A URL path rewriting rule with its compiled regex cached at load time.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
    regex: Option<Regex>,
}

impl RewriteRule {
    /// Builds a rule, caching the compiled `from` regex. An invalid regex
    /// leaves the cache empty and the rule falls back to raw string
    /// replacement; the loader rejects invalid patterns before this point.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let regex = Regex::new(&from).ok();
        Self {
            from,
            to: to.into(),
            regex,
        }
    }

    /// Applies the rewrite: regex replace-all with backreference support
    /// when the pattern compiled, plain string replacement otherwise.
    pub fn apply(&self, path: &str) -> String {
        match &self.regex {
            Some(regex) => regex.replace_all(path, self.to.as_str()).into_owned(),
            None => path.replace(&self.from, &self.to),
        }
    }
}

/// An HTTP route: a path pattern, its upstream target, and optional
/// rewrite and rate limit.
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: String,
    pub target: String,
    pub rewrite: Option<RewriteRule>,
    pub limiter: Option<Arc<RateLimiter>>,
}

impl Route {
    pub fn new(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            target: target.into(),
            rewrite: None,
            limiter: None,
        }
    }

    pub fn with_rewrite(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rewrite = Some(RewriteRule::new(from, to));
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

/// The outcome of matching a path against an entry's routes.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// Upstream to dial
    pub target: String,
    /// Path after any rewrite
    pub rewritten_path: String,
    /// False when the entry's default target was used
    pub matched: bool,
    /// Route-level limiter, when the matched route carries one
    pub limiter: Option<Arc<RateLimiter>>,
}

/// Compiled per-domain proxy configuration.
#[derive(Debug)]
pub struct ProxyEntry {
    /// Default upstream target as `host:port`
    pub target: String,
    /// Terminate TLS locally; false forwards ciphertext to the target
    pub terminate: bool,
    /// Protocol carried by terminated plaintext; ignored unless `terminate`
    pub proto: TerminatedProto,
    /// Entry-level rate limiter
    pub limiter: Option<Arc<RateLimiter>>,
    /// Per-entry byte and connection accounting
    pub metrics: Arc<Metrics>,
    routes: Vec<Route>,
}

impl ProxyEntry {
    /// Creates a plain pass-through entry for `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            terminate: false,
            proto: TerminatedProto::default(),
            limiter: None,
            metrics: Arc::new(Metrics::new()),
            routes: Vec::new(),
        }
    }

    pub fn with_termination(mut self, proto: TerminatedProto) -> Self {
        self.terminate = true;
        self.proto = proto;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_routes(mut self, routes: Vec<Route>) -> Self {
        self.routes = routes;
        sort_routes(&mut self.routes);
        self
    }

    /// Adds a route, keeping the list sorted. Only meaningful before the
    /// entry is published into the trie.
    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
        sort_routes(&mut self.routes);
    }

    /// Removes the route with the given pattern. Returns true if found.
    pub fn remove_route(&mut self, pattern: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.pattern != pattern);
        before != self.routes.len()
    }

    /// Routes in match order (longest pattern first).
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Finds the first route whose pattern matches `path` and applies its
    /// rewrite. Falls back to the entry's default target, unchanged path,
    /// and entry-level limiter when nothing matches.
    pub fn match_route(&self, path: &str) -> RouteMatch {
        for route in &self.routes {
            if matches_pattern(path, &route.pattern) {
                let rewritten_path = match &route.rewrite {
                    Some(rule) => rule.apply(path),
                    None => path.to_string(),
                };
                return RouteMatch {
                    target: route.target.clone(),
                    rewritten_path,
                    matched: true,
                    limiter: route.limiter.clone(),
                };
            }
        }

        RouteMatch {
            target: self.target.clone(),
            rewritten_path: path.to_string(),
            matched: false,
            limiter: self.limiter.clone(),
        }
    }
}

/// Builds a limiter from its document settings.
pub(super) fn limiter_from_doc(doc: &LimiterDoc) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        doc.rate,
        doc.burst,
        Duration::from_millis(doc.cooldown),
    ))
}

/// Longest pattern first; ties broken lexicographically ascending.
fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| {
        b.pattern
            .len()
            .cmp(&a.pattern.len())
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
}

/// Pattern matching: exact, `/*` prefix, or segment-boundary prefix.
fn matches_pattern(path: &str, pattern: &str) -> bool {
    if path == pattern {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path == prefix || path.starts_with(&format!("{prefix}/"));
    }

    if let Some(rest) = path.strip_prefix(pattern) {
        return rest.is_empty() || rest.starts_with('/');
    }

    false
}
