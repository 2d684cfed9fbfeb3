//! Storage whose writes can be switched off, for failure-path tests.

use std::sync::atomic::{AtomicBool, Ordering};

use super::{KvStorage, MemoryStorage, StorageUsage};
use crate::error::{Result, SyncError};

#[derive(Debug, Default)]
pub(crate) struct FlakyStorage {
  inner: MemoryStorage,
  fail_writes: AtomicBool,
  fail_reads: AtomicBool,
}

impl FlakyStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  fn check_read(&self) -> Result<()> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(SyncError::Storage("database is locked".to_string()));
    }
    Ok(())
  }

  fn check(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(SyncError::Storage("disk I/O error".to_string()));
    }
    Ok(())
  }
}

impl KvStorage for FlakyStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
    self.check_read()?;
    self.inner.get(key)
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.check()?;
    self.inner.set(key, value)
  }

  fn update(
    &self,
    key: &str,
    apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
  ) -> Result<()> {
    self.check()?;
    self.inner.update(key, apply)
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.check()?;
    self.inner.remove(key)
  }

  fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
    self.check_read()?;
    self.inner.scan_prefix(prefix)
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    self.check()?;
    self.inner.remove_prefix(prefix)
  }

  fn usage(&self) -> Result<StorageUsage> {
    self.inner.usage()
  }
}
