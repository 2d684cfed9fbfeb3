//! Cache store over a key-value storage namespace.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheStats, CachedResponse};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::router::in_family;
use crate::storage::{entry_size, KvStorage};

/// Namespace for cached API reads.
pub const DATA_NAMESPACE: &str = "cache_data_";

/// Namespace for cached documents (full pages).
pub const PAGE_NAMESPACE: &str = "cache_pages_";

/// Default TTL for cached data: 24 hours.
pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;

/// Counter bumped by every family eviction or clear, with the value it had
/// when each family was last evicted.
#[derive(Debug, Default)]
struct Invalidations {
  generation: u64,
  cleared_at: u64,
  families: HashMap<String, u64>,
}

impl Invalidations {
  fn bump(&mut self) -> u64 {
    self.generation += 1;
    self.generation
  }

  fn touched_since(&self, key: &str, since: u64) -> bool {
    self.cleared_at > since
      || self
        .families
        .iter()
        .any(|(family, at)| *at > since && in_family(key, family))
  }
}

/// A TTL cache living in one namespace of a shared storage backend.
pub struct CacheStore {
  storage: Arc<dyn KvStorage>,
  namespace: String,
  clock: Arc<dyn Clock>,
  default_ttl: Duration,
  invalidations: Mutex<Invalidations>,
}

impl CacheStore {
  pub fn new(storage: Arc<dyn KvStorage>, namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
    Self {
      storage,
      namespace: namespace.into(),
      clock,
      default_ttl: Duration::seconds(DEFAULT_TTL_SECS),
      invalidations: Mutex::new(Invalidations::default()),
    }
  }

  /// Set the TTL used by `put`.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn invalidations(&self) -> MutexGuard<'_, Invalidations> {
    self.invalidations.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Current invalidation generation. Take it before fetching data that will
  /// be stored with `set_unless_invalidated`.
  pub fn generation(&self) -> u64 {
    self.invalidations().generation
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.namespace, key)
  }

  /// Store a payload that expires `ttl` from now.
  pub fn set(&self, key: &str, data: CachedResponse, ttl: Duration) -> Result<CacheEntry> {
    if ttl <= Duration::zero() {
      return Err(SyncError::InvalidTtl);
    }

    let created_at = self.clock.now();
    let entry = CacheEntry {
      key: key.to_string(),
      data,
      created_at,
      expires_at: created_at + ttl,
    };
    let json = serde_json::to_string(&entry)?;
    self.storage.set(&self.storage_key(key), &json)?;

    Ok(entry)
  }

  /// Store a payload with the default TTL.
  pub fn put(&self, key: &str, data: CachedResponse) -> Result<CacheEntry> {
    self.set(key, data, self.default_ttl)
  }

  /// Store a payload, making room by evicting the oldest entries of this
  /// namespace if the storage quota is exhausted. Retries exactly once.
  pub fn set_evicting(&self, key: &str, data: CachedResponse, ttl: Duration) -> Result<CacheEntry> {
    match self.set(key, data.clone(), ttl) {
      Err(SyncError::StorageQuotaExceeded { needed, available }) => {
        debug!(key, needed, available, "cache quota exceeded, evicting oldest entries");
        self.evict_oldest_until(needed)?;
        self.set(key, data, ttl)
      }
      other => other,
    }
  }

  /// Store a payload fetched at `since` (a `generation` value), unless the
  /// key's family was evicted or the namespace cleared in the meantime, in
  /// which case the data predates a write and is dropped. Returns `None` when
  /// nothing was stored.
  pub fn set_unless_invalidated(
    &self,
    key: &str,
    data: CachedResponse,
    ttl: Duration,
    since: u64,
  ) -> Result<Option<CacheEntry>> {
    // Held across the write so an eviction cannot slip in between
    let invalidations = self.invalidations();
    if invalidations.touched_since(key, since) {
      debug!(key, since, "dropping fetch that predates an invalidation");
      return Ok(None);
    }
    self.set_evicting(key, data, ttl).map(Some)
  }

  /// Look up a payload. Returns `None` for a miss; an expired entry counts as
  /// a miss and is removed on the way out.
  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let storage_key = self.storage_key(key);
    let Some(json) = self.storage.get(&storage_key)? else {
      debug!(key, "cache miss");
      return Ok(None);
    };

    let entry: CacheEntry = match serde_json::from_str(&json) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "dropping unreadable cache entry");
        self.storage.remove(&storage_key)?;
        return Ok(None);
      }
    };

    if !entry.is_valid(self.clock.now()) {
      debug!(key, expires_at = %entry.expires_at, "cache entry expired");
      self.storage.remove(&storage_key)?;
      return Ok(None);
    }

    debug!(key, "cache hit");
    Ok(Some(entry))
  }

  pub fn evict(&self, key: &str) -> Result<()> {
    self.storage.remove(&self.storage_key(key))
  }

  /// Remove every entry in this namespace, and nothing outside it.
  pub fn clear(&self) -> Result<usize> {
    let mut invalidations = self.invalidations();
    let generation = invalidations.bump();
    invalidations.cleared_at = generation;
    self.storage.remove_prefix(&self.namespace)
  }

  /// Remove every entry whose key belongs to the route family, returning the
  /// removed keys.
  pub fn evict_family(&self, family: &str) -> Result<Vec<String>> {
    let mut invalidations = self.invalidations();
    let generation = invalidations.bump();
    invalidations.families.insert(family.to_string(), generation);

    let mut removed = Vec::new();
    for key in self.keys()? {
      if in_family(&key, family) {
        self.storage.remove(&self.storage_key(&key))?;
        removed.push(key);
      }
    }
    if !removed.is_empty() {
      debug!(family, count = removed.len(), "evicted cache family");
    }
    Ok(removed)
  }

  /// Keys currently stored in this namespace, expired or not.
  pub fn keys(&self) -> Result<Vec<String>> {
    Ok(
      self
        .storage
        .scan_prefix(&self.namespace)?
        .into_iter()
        .map(|(k, _)| k[self.namespace.len()..].to_string())
        .collect(),
    )
  }

  /// Single pass over the namespace. Expired entries not yet touched are
  /// still counted.
  pub fn stats(&self) -> Result<CacheStats> {
    let mut stats = CacheStats::default();
    let mut oldest = None;
    let mut newest = None;

    for (storage_key, json) in self.storage.scan_prefix(&self.namespace)? {
      stats.count += 1;
      stats.approx_size_bytes += entry_size(&storage_key, &json);

      let Ok(entry) = serde_json::from_str::<CacheEntry>(&json) else {
        continue;
      };
      if oldest.as_ref().map_or(true, |(at, _)| entry.created_at < *at) {
        oldest = Some((entry.created_at, entry.key.clone()));
      }
      if newest.as_ref().map_or(true, |(at, _)| entry.created_at >= *at) {
        newest = Some((entry.created_at, entry.key));
      }
    }

    stats.oldest_key = oldest.map(|(_, k)| k);
    stats.newest_key = newest.map(|(_, k)| k);
    Ok(stats)
  }

  /// Evict entries oldest-first until `needed` bytes are free or the
  /// namespace is empty.
  fn evict_oldest_until(&self, needed: usize) -> Result<()> {
    let mut entries: Vec<(String, chrono::DateTime<chrono::Utc>)> = self
      .storage
      .scan_prefix(&self.namespace)?
      .into_iter()
      .map(|(storage_key, json)| {
        let created_at = serde_json::from_str::<CacheEntry>(&json)
          .map(|e| e.created_at)
          .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        (storage_key, created_at)
      })
      .collect();
    entries.sort_by_key(|(_, created_at)| *created_at);

    for (storage_key, _) in entries {
      match self.storage.usage()?.available() {
        Some(available) if available < needed => {
          debug!(key = %storage_key, "evicting for space");
          self.storage.remove(&storage_key)?;
        }
        _ => break,
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::storage::MemoryStorage;

  fn payload(body: &str) -> CachedResponse {
    CachedResponse {
      status: 200,
      content_type: Some("application/json".to_string()),
      body: body.to_string(),
    }
  }

  fn store_with(storage: Arc<dyn KvStorage>) -> (CacheStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let store = CacheStore::new(storage, DATA_NAMESPACE, clock.clone());
    (store, clock)
  }

  #[test]
  fn test_set_and_get() {
    let (store, _) = store_with(Arc::new(MemoryStorage::new()));
    let entry = store.put("/api/subjects", payload("[1]")).unwrap();
    assert_eq!(entry.expires_at - entry.created_at, Duration::hours(24));

    let cached = store.get("/api/subjects").unwrap().unwrap();
    assert_eq!(cached.data.body, "[1]");
    assert!(store.get("/api/other").unwrap().is_none());
  }

  #[test]
  fn test_expired_get_is_miss_and_evicts() {
    let (store, clock) = store_with(Arc::new(MemoryStorage::new()));
    store.set("/api/a", payload("a"), Duration::seconds(60)).unwrap();
    store.set("/api/b", payload("b"), Duration::hours(1)).unwrap();
    assert_eq!(store.stats().unwrap().count, 2);

    // Still valid exactly at expiry
    clock.advance(Duration::seconds(60));
    assert!(store.get("/api/a").unwrap().is_some());

    clock.advance(Duration::seconds(1));
    assert!(store.get("/api/a").unwrap().is_none());
    assert_eq!(store.stats().unwrap().count, 1);
  }

  #[test]
  fn test_non_positive_ttl_rejected() {
    let (store, _) = store_with(Arc::new(MemoryStorage::new()));
    let err = store.set("/api/a", payload("a"), Duration::zero()).unwrap_err();
    assert!(matches!(err, SyncError::InvalidTtl));
  }

  #[test]
  fn test_clear_only_touches_own_namespace() {
    let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let data = CacheStore::new(storage.clone(), DATA_NAMESPACE, clock.clone());
    let pages = CacheStore::new(storage.clone(), PAGE_NAMESPACE, clock);
    storage.set("offline_queue", "[]").unwrap();

    data.put("/api/a", payload("a")).unwrap();
    pages.put("/", payload("<html>")).unwrap();

    assert_eq!(data.clear().unwrap(), 1);
    assert!(pages.get("/").unwrap().is_some());
    assert!(storage.get("offline_queue").unwrap().is_some());
  }

  #[test]
  fn test_evict_family_matches_prefix_boundaries() {
    let (store, _) = store_with(Arc::new(MemoryStorage::new()));
    store.put("/api/subjects", payload("all")).unwrap();
    store.put("/api/subjects/42", payload("one")).unwrap();
    store.put("/api/subjects?week=2", payload("week")).unwrap();
    store.put("/api/subjectsummary", payload("other")).unwrap();
    store.put("/api/tasks", payload("tasks")).unwrap();

    let mut removed = store.evict_family("/api/subjects").unwrap();
    removed.sort();
    assert_eq!(
      removed,
      vec!["/api/subjects", "/api/subjects/42", "/api/subjects?week=2"]
    );
    assert!(store.get("/api/subjectsummary").unwrap().is_some());
    assert!(store.get("/api/tasks").unwrap().is_some());
  }

  #[test]
  fn test_stats_oldest_and_newest() {
    let (store, clock) = store_with(Arc::new(MemoryStorage::new()));
    assert_eq!(store.stats().unwrap(), CacheStats::default());

    store.put("/api/first", payload("1")).unwrap();
    clock.advance(Duration::seconds(1));
    store.put("/api/second", payload("2")).unwrap();
    clock.advance(Duration::seconds(1));
    store.put("/api/third", payload("3")).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.count, 3);
    assert!(stats.approx_size_bytes > 0);
    assert_eq!(stats.oldest_key.as_deref(), Some("/api/first"));
    assert_eq!(stats.newest_key.as_deref(), Some("/api/third"));
  }

  #[test]
  fn test_set_evicting_drops_oldest_when_full() {
    let (store, clock) = store_with(Arc::new(MemoryStorage::with_quota(600)));
    let body = "x".repeat(100);

    let mut stored = Vec::new();
    for i in 0.. {
      let key = format!("/api/item/{}", i);
      match store.put(&key, payload(&body)) {
        Ok(_) => stored.push(key),
        Err(SyncError::StorageQuotaExceeded { .. }) => break,
        Err(e) => panic!("unexpected error: {}", e),
      }
      clock.advance(Duration::seconds(1));
    }
    assert!(stored.len() >= 2);

    store
      .set_evicting("/api/new", payload(&body), Duration::hours(1))
      .unwrap();

    assert!(store.get("/api/new").unwrap().is_some());
    assert!(store.get(&stored[0]).unwrap().is_none());
    assert!(store.get(stored.last().unwrap()).unwrap().is_some());
  }

  #[test]
  fn test_fetch_started_before_family_eviction_is_dropped() {
    let (store, _) = store_with(Arc::new(MemoryStorage::new()));
    let before_write = store.generation();
    store.evict_family("/api/subjects").unwrap();

    let stored = store
      .set_unless_invalidated(
        "/api/subjects?week=1",
        payload("old"),
        Duration::hours(1),
        before_write,
      )
      .unwrap();
    assert!(stored.is_none());
    assert!(store.get("/api/subjects?week=1").unwrap().is_none());

    // Other families and later fetches are unaffected
    assert!(store
      .set_unless_invalidated("/api/tasks", payload("t"), Duration::hours(1), before_write)
      .unwrap()
      .is_some());
    let after_write = store.generation();
    assert!(store
      .set_unless_invalidated("/api/subjects", payload("new"), Duration::hours(1), after_write)
      .unwrap()
      .is_some());
  }

  #[test]
  fn test_fetch_started_before_clear_is_dropped() {
    let (store, _) = store_with(Arc::new(MemoryStorage::new()));
    let since = store.generation();
    store.clear().unwrap();
    assert!(store
      .set_unless_invalidated("/api/tasks", payload("t"), Duration::hours(1), since)
      .unwrap()
      .is_none());
  }
}
