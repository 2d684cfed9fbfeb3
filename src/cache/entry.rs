//! Cache entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::NetResponse;

/// Payload kept for a cached response. The body is opaque to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content_type: Option<String>,
  pub body: String,
}

impl From<NetResponse> for CachedResponse {
  fn from(response: NetResponse) -> Self {
    Self {
      status: response.status,
      content_type: response.content_type,
      body: response.body,
    }
  }
}

/// A cached payload with its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub data: CachedResponse,
  pub created_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  /// An entry is usable up to and including its expiry instant.
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    now <= self.expires_at
  }
}

/// Diagnostics snapshot of one cache namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub count: usize,
  pub approx_size_bytes: usize,
  pub oldest_key: Option<String>,
  pub newest_key: Option<String>,
}
