//! Configuration for the Manifold proxy.
//!
//! The on-disk YAML document is loaded through Figment (file merged with
//! `MANIFOLD_`-prefixed environment variables), validated, and compiled
//! into a [`DomainTrie`] of [`ProxyEntry`] values ready for concurrent
//! lookup by the dispatcher.

mod document;
pub(crate) mod defaults;
mod proxy;
mod trie;

pub use document::{Document, LimiterDoc, LogDoc, ProxyDoc, RewriteDoc, RouteDoc, TerminatedProto};
pub use proxy::{ProxyEntry, Route, RouteMatch, RewriteRule};
pub use trie::DomainTrie;

use std::path::Path;
use std::sync::Arc;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::error::{ConfigError, Result};

pub trait ConfigInit<T: DeserializeOwned> {
    /// Initializes the configuration object from the given Figment
    fn init(figment: Figment) -> Result<T> {
        Ok(figment.extract()?)
    }
}

pub trait FromPath<T: DeserializeOwned + ConfigInit<T>> {
    /// Creates a configuration object from the given path, merging
    /// `MANIFOLD_`-prefixed environment variables over the file.
    fn from_path(path: &Path) -> Result<T> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("MANIFOLD_").split("__"));

        T::init(figment)
    }
}

impl ConfigInit<Document> for Document {}
impl FromPath<Document> for Document {}

/// The loaded configuration: proxy entries indexed by domain.
pub struct Config {
    proxies: DomainTrie<Arc<ProxyEntry>>,
    /// Log level from the document, applied by the binary at startup.
    pub log: LogDoc,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self {
            proxies: DomainTrie::new(),
            log: LogDoc::default(),
        }
    }

    /// Loads and validates configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::build(Document::from_path(path)?)
    }

    /// Loads and validates configuration from a YAML string.
    pub fn load_str(yaml: &str) -> Result<Self> {
        let document: Document = Figment::new().merge(Yaml::string(yaml)).extract()?;
        Self::build(document)
    }

    /// Validates a parsed document and compiles it into proxy entries.
    pub fn build(document: Document) -> Result<Self> {
        let config = Self {
            proxies: DomainTrie::new(),
            log: document.log,
        };

        for (domain, doc) in document.proxies {
            if doc.target.is_empty() {
                return Err(ConfigError::EmptyTarget { domain }.into());
            }
            if doc.terminate && doc.proto.is_none() {
                return Err(ConfigError::MissingField {
                    field: format!("proxies.{domain}.proto"),
                }
                .into());
            }

            let mut entry = ProxyEntry::new(&doc.target);
            if doc.terminate {
                entry = entry.with_termination(doc.proto.unwrap_or_default());
            }
            if let Some(limiter) = &doc.rate_limit {
                entry = entry.with_limiter(proxy::limiter_from_doc(limiter));
            }

            let mut routes = Vec::with_capacity(doc.routes.len());
            for route_doc in &doc.routes {
                if route_doc.target.is_empty() {
                    return Err(ConfigError::EmptyRouteTarget {
                        pattern: route_doc.pattern.clone(),
                        domain,
                    }
                    .into());
                }

                let mut route = Route::new(&route_doc.pattern, &route_doc.target);
                if let Some(rewrite) = &route_doc.rewrite {
                    if !rewrite.from.is_empty() {
                        if let Err(err) = Regex::new(&rewrite.from) {
                            return Err(ConfigError::InvalidRewriteRegex {
                                pattern: rewrite.from.clone(),
                                domain,
                                reason: err.to_string(),
                            }
                            .into());
                        }
                    }
                    route = route.with_rewrite(&rewrite.from, &rewrite.to);
                }
                if let Some(limiter) = &route_doc.rate_limit {
                    route = route.with_limiter(proxy::limiter_from_doc(limiter));
                }
                routes.push(route);
            }

            config
                .proxies
                .set(&domain, Arc::new(entry.with_routes(routes)));
        }

        Ok(config)
    }

    /// Finds the proxy entry for a domain, honoring `*` wildcards.
    pub fn entry(&self, domain: &str) -> Option<Arc<ProxyEntry>> {
        self.proxies.get(domain)
    }

    /// All configured domains, for certificate management.
    pub fn domains(&self) -> Vec<String> {
        self.proxies.keys()
    }

    /// Adds (or atomically replaces) a plain pass-through proxy entry.
    pub fn add_proxy(&self, domain: &str, target: &str) -> Result<()> {
        if target.is_empty() {
            return Err(ConfigError::EmptyTarget {
                domain: domain.to_string(),
            }
            .into());
        }
        self.proxies.set(domain, Arc::new(ProxyEntry::new(target)));
        Ok(())
    }

    /// Adds (or atomically replaces) a proxy entry with routes, applying
    /// the same validation as the loader.
    pub fn add_proxy_with_routes(
        &self,
        domain: &str,
        target: &str,
        routes: Vec<Route>,
    ) -> Result<()> {
        if target.is_empty() {
            return Err(ConfigError::EmptyTarget {
                domain: domain.to_string(),
            }
            .into());
        }
        for route in &routes {
            if route.target.is_empty() {
                return Err(ConfigError::EmptyRouteTarget {
                    pattern: route.pattern.clone(),
                    domain: domain.to_string(),
                }
                .into());
            }
        }

        self.proxies
            .set(domain, Arc::new(ProxyEntry::new(target).with_routes(routes)));
        Ok(())
    }

    /// Removes a proxy entry. Returns true if the domain was configured.
    pub fn remove_proxy(&self, domain: &str) -> bool {
        self.proxies.delete(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ManifoldError;

    #[test]
    fn parse_full_document() {
        let yaml = r#"
proxies:
  app.com:
    target: "localhost:8080"
    rate_limit:
      rate: 10
      burst: 10
      cooldown: 60000
    routes:
      - pattern: "/api/*"
        target: "localhost:3000"

      - pattern: "/v1/*"
        target: "localhost:8001"
        rewrite:
          from: "^/v1/(.*)"
          to: "/$1"

      - pattern: "/health"
        target: "localhost:8080"
        rate_limit:
          burst: 10
          rate: 10
          cooldown: 60000
"#;

        let config = Config::load_str(yaml).expect("Failed to parse config");

        let entry = config.entry("app.com").unwrap();
        assert!(entry.limiter.is_some());
        assert_eq!(entry.target, "localhost:8080");

        let result = entry.match_route("/v1/api");
        assert_eq!(result.rewritten_path, "/api");

        let result = entry.match_route("/api/create");
        assert_eq!(result.rewritten_path, "/api/create");
        assert_eq!(result.target, "localhost:3000");

        let result = entry.match_route("/health");
        assert_eq!(result.rewritten_path, "/health");
        assert!(result.limiter.is_some());
    }

    #[test]
    fn parse_terminated_entry() {
        let yaml = r#"
proxies:
  app.com:
    target: "localhost:8084"
    terminate: true
    proto: http
"#;
        let config = Config::load_str(yaml).unwrap();
        let entry = config.entry("app.com").unwrap();
        assert!(entry.terminate);
        assert_eq!(entry.proto, TerminatedProto::Http);
    }

    #[test]
    fn terminate_requires_proto() {
        let yaml = r#"
proxies:
  app.com:
    target: "localhost:8084"
    terminate: true
"#;
        let err = Config::load_str(yaml).unwrap_err();
        assert!(matches!(
            err,
            ManifoldError::Config(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn empty_target_is_rejected() {
        let yaml = r#"
proxies:
  app.com:
    target: ""
"#;
        let err = Config::load_str(yaml).unwrap_err();
        assert!(matches!(
            err,
            ManifoldError::Config(ConfigError::EmptyTarget { .. })
        ));
    }

    #[test]
    fn invalid_rewrite_regex_is_rejected() {
        let yaml = r#"
proxies:
  app.com:
    target: "localhost:8080"
    routes:
      - pattern: "/api/*"
        target: "localhost:3000"
        rewrite:
          from: "[unclosed"
          to: ""
"#;
        let err = Config::load_str(yaml).unwrap_err();
        assert!(matches!(
            err,
            ManifoldError::Config(ConfigError::InvalidRewriteRegex { .. })
        ));
    }

    #[test]
    fn wildcard_domains_resolve() {
        let yaml = r#"
proxies:
  "*.app.com":
    target: "localhost:9000"
  app.com:
    target: "localhost:9001"
"#;
        let config = Config::load_str(yaml).unwrap();
        assert_eq!(config.entry("api.app.com").unwrap().target, "localhost:9000");
        assert_eq!(config.entry("app.com").unwrap().target, "localhost:9001");
        assert!(config.entry("other.net").is_none());
    }

    #[test]
    fn limiter_defaults_apply_when_keys_are_absent() {
        let yaml = r#"
proxies:
  app.com:
    target: "localhost:8080"
    rate_limit: {}
"#;
        let config = Config::load_str(yaml).unwrap();
        assert!(config.entry("app.com").unwrap().limiter.is_some());
    }

    #[test]
    fn programmatic_mutation_round_trips() {
        let config = Config::new();
        config.add_proxy("app.com", "localhost:8080").unwrap();
        assert!(config.entry("app.com").is_some());

        config
            .add_proxy_with_routes(
                "app.com",
                "localhost:8080",
                vec![Route::new("/api/*", "localhost:3000")],
            )
            .unwrap();
        assert!(config.entry("app.com").unwrap().match_route("/api/x").matched);

        assert!(config.remove_proxy("app.com"));
        assert!(config.entry("app.com").is_none());

        assert!(config.add_proxy("app.com", "").is_err());
    }

    #[test]
    fn domains_lists_configured_keys() {
        let yaml = r#"
proxies:
  app.com:
    target: "localhost:1"
  "*.app.com":
    target: "localhost:2"
"#;
        let config = Config::load_str(yaml).unwrap();
        let mut domains = config.domains();
        domains.sort();
        assert_eq!(domains, vec!["*.app.com", "app.com"]);
    }
}
