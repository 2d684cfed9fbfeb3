//! Static strategy selection for outbound requests.
//!
//! Every request is classified (write, read, document) and matched against an
//! ordered rule table; the first matching rule picks the strategy. Nothing
//! about the payload or the current network state influences the choice.

use crate::config::Config;
use crate::network::{path_of, Method, Request, RequestKind};

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Serve a valid cache hit immediately, refresh in the background regardless.
  CacheFirst,
  /// Try the network; queue the write if the network is unreachable.
  NetworkFirst,
  /// Network with a short timeout, falling back to the last cached page.
  StaleWhileRevalidate,
  /// Pass straight through, no cache and no queue.
  NetworkOnly,
}

/// Request class used as the first rule key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Write,
  Read,
  Document,
}

/// A route pattern: either an exact path or a prefix ending in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern(String);

impl RoutePattern {
  pub fn new(pattern: impl Into<String>) -> Self {
    Self(pattern.into())
  }

  pub fn matches(&self, path: &str) -> bool {
    match self.0.strip_suffix('*') {
      Some(prefix) => path.starts_with(prefix),
      None => path == self.0,
    }
  }
}

#[derive(Debug, Clone)]
struct Rule {
  class: RequestClass,
  pattern: RoutePattern,
  strategy: Strategy,
}

/// Ordered (class, pattern) -> strategy table.
#[derive(Debug, Clone)]
pub struct RouteTable {
  api_base_path: String,
  document_routes: Vec<RoutePattern>,
  rules: Vec<Rule>,
}

impl RouteTable {
  /// A table where writes are network-first, documents are
  /// stale-while-revalidate, and reads pass through until routes are
  /// allowlisted with `cacheable`.
  pub fn new(api_base_path: impl Into<String>) -> Self {
    Self {
      api_base_path: api_base_path.into().trim_end_matches('/').to_string(),
      document_routes: Vec::new(),
      rules: vec![
        Rule {
          class: RequestClass::Write,
          pattern: RoutePattern::new("*"),
          strategy: Strategy::NetworkFirst,
        },
        Rule {
          class: RequestClass::Document,
          pattern: RoutePattern::new("*"),
          strategy: Strategy::StaleWhileRevalidate,
        },
      ],
    }
  }

  pub fn from_config(config: &Config) -> Self {
    let mut table = Self::new(config.backend.api_base_path.clone());
    for pattern in &config.cache.routes {
      table = table.cacheable(pattern.clone());
    }
    for pattern in &config.cache.document_routes {
      table = table.document_route(pattern.clone());
    }
    table
  }

  /// Allowlist a read route for cache-first serving.
  pub fn cacheable(mut self, pattern: impl Into<String>) -> Self {
    self.rules.push(Rule {
      class: RequestClass::Read,
      pattern: RoutePattern::new(pattern),
      strategy: Strategy::CacheFirst,
    });
    self
  }

  /// Treat plain GETs of this route as page loads.
  pub fn document_route(mut self, pattern: impl Into<String>) -> Self {
    self.document_routes.push(RoutePattern::new(pattern));
    self
  }

  pub fn classify(&self, request: &Request) -> Option<RequestClass> {
    if request.method.is_write() {
      return Some(RequestClass::Write);
    }
    if request.method != Method::Get {
      return None;
    }
    let path = request.path();
    if request.kind == RequestKind::Document || self.document_routes.iter().any(|p| p.matches(path))
    {
      Some(RequestClass::Document)
    } else {
      Some(RequestClass::Read)
    }
  }

  pub fn strategy_for(&self, request: &Request) -> Strategy {
    let Some(class) = self.classify(request) else {
      return Strategy::NetworkOnly;
    };
    let path = request.path();
    self
      .rules
      .iter()
      .find(|rule| rule.class == class && rule.pattern.matches(path))
      .map(|rule| rule.strategy)
      .unwrap_or(Strategy::NetworkOnly)
  }

  /// The route family a URL belongs to: the API base path plus the first
  /// segment after it (`/api/subjects/42/attendance` -> `/api/subjects`).
  /// Paths outside the API base use their own first segment.
  pub fn family_of(&self, url: &str) -> String {
    let path = path_of(url);
    let (base, rest) = match path.strip_prefix(self.api_base_path.as_str()) {
      Some(rest) if !self.api_base_path.is_empty() && (rest.is_empty() || rest.starts_with('/')) => {
        (self.api_base_path.as_str(), rest)
      }
      _ => ("", path),
    };
    let segment = rest
      .trim_start_matches('/')
      .split('/')
      .next()
      .unwrap_or_default();
    format!("{}/{}", base, segment)
  }
}

/// Whether a cache key (path plus optional query) belongs to a route family.
pub fn in_family(key: &str, family: &str) -> bool {
  match key.strip_prefix(family) {
    Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
    None => false,
  }
}
