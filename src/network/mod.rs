//! The network boundary: the only way the engine reaches the backend.
//!
//! The engine never looks inside payloads. A request is a method, a URL,
//! optional headers and an optional body; a response is a status and a body.

mod http;

#[cfg(test)]
pub(crate) mod fake;

pub use http::HttpNetwork;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// HTTP methods the engine routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Whether the method changes server state.
  pub fn is_write(self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(SyncError::Config(format!("unsupported method: {}", other))),
    }
  }
}

/// What the caller is loading. Documents are whole pages; everything else is
/// an API call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestKind {
  #[default]
  Api,
  Document,
}

/// A logical request as issued by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  /// Path (with query) relative to the backend, or an absolute URL.
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<String>,
  pub kind: RequestKind,
}

impl Request {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Vec::new(),
      body: None,
      kind: RequestKind::Api,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::Get, url)
  }

  /// A full-page load.
  pub fn document(url: impl Into<String>) -> Self {
    Self {
      kind: RequestKind::Document,
      ..Self::new(Method::Get, url)
    }
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Path part of the URL (query and fragment stripped), used for routing.
  pub fn path(&self) -> &str {
    path_of(&self.url)
  }

  /// Path and query, used as the cache key.
  pub fn cache_key(&self) -> &str {
    cache_key_of(&self.url)
  }
}

/// What came back from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: String,
}

impl NetResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      content_type: None,
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Transport to the backend.
///
/// `Err` means the request never got an HTTP answer (DNS, refused connection,
/// timeout). Any HTTP status, including 5xx, is an `Ok` response.
#[async_trait]
pub trait Network: Send + Sync {
  async fn request(&self, request: &Request) -> Result<NetResponse>;
}

/// Cache key for a URL: path and query, with scheme, authority and fragment
/// stripped, so absolute and relative forms of one resource share an entry.
pub fn cache_key_of(url: &str) -> &str {
  let rest = match url.find("://") {
    Some(idx) => {
      let after = &url[idx + 3..];
      match after.find('/') {
        Some(slash) => &after[slash..],
        None => "/",
      }
    }
    None => url,
  };
  let end = rest.find('#').unwrap_or(rest.len());
  &rest[..end]
}

/// Strip scheme/authority, query and fragment from a URL or path.
pub fn path_of(url: &str) -> &str {
  let rest = cache_key_of(url);
  let end = rest.find('?').unwrap_or(rest.len());
  &rest[..end]
}
