//! Error types for the sync engine.
//!
//! A cache miss is not an error: lookups return `Option` and callers decide.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
  /// The persistence layer refused a write because its byte quota is used up.
  /// Recoverable by evicting older cache entries and retrying once.
  #[error("storage quota exceeded: {needed} bytes needed, {available} available")]
  StorageQuotaExceeded { needed: usize, available: usize },

  /// The network boundary could not deliver the request (transport failure or timeout).
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  /// A read had neither a usable cache entry nor a reachable network.
  #[error("offline and no cached data for {key}")]
  OfflineNoData { key: String },

  /// A queued write was abandoned after hitting the retry ceiling.
  #[error("gave up on {method} {url} after {attempts} attempts")]
  RetryExhausted {
    method: String,
    url: String,
    attempts: u32,
  },

  #[error("cache TTL must be positive")]
  InvalidTtl,

  #[error("storage error: {0}")]
  Storage(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("config error: {0}")]
  Config(String),
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::Storage(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, SyncError>;
