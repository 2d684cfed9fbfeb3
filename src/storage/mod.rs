//! Namespaced key-value persistence shared by the cache and the mutation queue.
//!
//! Subsystems share one backend and keep apart by key prefix (`cache_data_`,
//! `cache_pages_`, `offline_queue`). Sizes are accounted as key bytes plus
//! value bytes, which is what a byte quota is checked against.

#[cfg(test)]
pub(crate) mod flaky;
mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::{Result, SyncError};

/// Storage backend for cache entries and the mutation queue.
pub trait KvStorage: Send + Sync {
  /// Read a value.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Write a value, overwriting any previous one.
  ///
  /// Fails with `SyncError::StorageQuotaExceeded` when the write would push
  /// usage over the backend's quota.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Read-modify-write one key atomically with respect to every other writer
  /// of the backend, including other processes sharing it. `apply` gets the
  /// current value and returns the new one (`None` removes the key). Nothing
  /// is written if `apply` fails or the new value would exceed the quota.
  fn update(
    &self,
    key: &str,
    apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
  ) -> Result<()>;

  /// Remove a value. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// All key/value pairs whose key starts with `prefix`, ordered by key.
  fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

  /// Remove every key starting with `prefix`, returning how many were removed.
  fn remove_prefix(&self, prefix: &str) -> Result<usize>;

  /// Bytes currently stored and the quota, if the backend has one.
  fn usage(&self) -> Result<StorageUsage>;
}

/// Byte accounting for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
  pub used_bytes: usize,
  pub quota_bytes: Option<usize>,
}

impl StorageUsage {
  /// Bytes that can still be written, `None` when unbounded.
  pub fn available(&self) -> Option<usize> {
    self
      .quota_bytes
      .map(|quota| quota.saturating_sub(self.used_bytes))
  }
}

/// Size of a stored pair as counted against a quota.
pub(crate) fn entry_size(key: &str, value: &str) -> usize {
  key.len() + value.len()
}

/// Fail with `StorageQuotaExceeded` if writing `value` under `key`, replacing
/// a value of `replaced` bytes, would take usage past `quota`.
pub(crate) fn check_quota(
  quota: Option<usize>,
  used: usize,
  replaced: usize,
  key: &str,
  value: &str,
) -> Result<()> {
  let Some(quota) = quota else {
    return Ok(());
  };
  let needed = entry_size(key, value);
  let available = quota.saturating_sub(used.saturating_sub(replaced));
  if needed > available {
    return Err(SyncError::StorageQuotaExceeded { needed, available });
  }
  Ok(())
}
