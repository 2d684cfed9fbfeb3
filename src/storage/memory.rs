//! In-process storage backend.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{check_quota, entry_size, KvStorage, StorageUsage};
use crate::error::{Result, SyncError};

/// Storage held in memory. Nothing survives the process, but a handle can be
/// shared across engine instances to stand in for a persistent backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a store that refuses writes past `quota_bytes`.
  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }

  fn ensure_fits(&self, entries: &BTreeMap<String, String>, key: &str, value: &str) -> Result<()> {
    let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
    let replaced = entries.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
    check_quota(self.quota_bytes, used, replaced, key, value)
  }
}

impl KvStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut entries = self.lock()?;
    self.ensure_fits(&entries, key, value)?;
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn update(
    &self,
    key: &str,
    apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
  ) -> Result<()> {
    let mut entries = self.lock()?;
    match apply(entries.get(key).cloned())? {
      Some(value) => {
        self.ensure_fits(&entries, key, &value)?;
        entries.insert(key.to_string(), value);
      }
      None => {
        entries.remove(key);
      }
    }
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
    Ok(
      self
        .lock()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    let mut entries = self.lock()?;
    let before = entries.len();
    entries.retain(|k, _| !k.starts_with(prefix));
    Ok(before - entries.len())
  }

  fn usage(&self) -> Result<StorageUsage> {
    let used_bytes = self.lock()?.iter().map(|(k, v)| entry_size(k, v)).sum();
    Ok(StorageUsage {
      used_bytes,
      quota_bytes: self.quota_bytes,
    })
  }
}
