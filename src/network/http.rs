//! reqwest-backed network boundary.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Method, NetResponse, Network, Request};
use crate::error::{Result, SyncError};

/// HTTP client for the backend.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  base_url: Url,
  /// Session headers attached to every request
  session_headers: Vec<(String, String)>,
}

impl HttpNetwork {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| SyncError::Config(format!("Invalid backend URL {}: {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      session_headers: Vec::new(),
    })
  }

  /// Attach a header (e.g. the session's `Authorization`) to every request.
  pub fn with_session_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.session_headers.push((name.into(), value.into()));
    self
  }

  fn resolve(&self, url: &str) -> Result<Url> {
    self
      .base_url
      .join(url)
      .map_err(|e| SyncError::Config(format!("Invalid request URL {}: {}", url, e)))
  }
}

fn to_reqwest(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn request(&self, request: &Request) -> Result<NetResponse> {
    let url = self.resolve(&request.url)?;
    debug!(method = %request.method, %url, "network request");

    let mut builder = self.client.request(to_reqwest(request.method), url);
    for (name, value) in self.session_headers.iter().chain(request.headers.iter()) {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| SyncError::NetworkUnavailable(e.to_string()))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .text()
      .await
      .map_err(|e| SyncError::NetworkUnavailable(e.to_string()))?;

    Ok(NetResponse {
      status,
      content_type,
      body,
    })
  }
}
