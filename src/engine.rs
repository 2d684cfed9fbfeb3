//! Request handling: applies the routed strategy to each request.
//!
//! The engine owns the cache namespaces, the mutation queue and the network
//! handle. Build it once at startup and share it behind an `Arc`.

use chrono::{DateTime, Duration as TtlDuration, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStore, DATA_NAMESPACE, PAGE_NAMESPACE};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::network::{NetResponse, Network, Request};
use crate::queue::{DrainReport, MutationQueue, QueueItem};
use crate::router::{RouteTable, Strategy};
use crate::storage::KvStorage;
use crate::views::ViewRegistry;

/// Served when a page is requested offline and was never cached.
pub const OFFLINE_DOCUMENT: &str = "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Offline</title></head>\n<body>\n<h1>You are offline</h1>\n<p>This page has not been saved for offline use. It will load once the connection is back.</p>\n</body>\n</html>\n";

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the backend
  Network,
  /// From the local cache
  Cache,
  /// Synthetic: the write was queued for later
  Queued,
  /// Synthetic: the built-in offline page
  OfflineFallback,
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: String,
  pub source: ResponseSource,
  /// When the data was cached (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Response {
  pub fn from_network(response: NetResponse) -> Self {
    Self {
      status: response.status,
      content_type: response.content_type,
      body: response.body,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(entry: &CacheEntry) -> Self {
    Self {
      status: entry.data.status,
      content_type: entry.data.content_type.clone(),
      body: entry.data.body.clone(),
      source: ResponseSource::Cache,
      cached_at: Some(entry.created_at),
    }
  }

  /// "Accepted, queued" answer for a write that will be replayed later.
  pub fn queued(item: &QueueItem) -> Self {
    let body = serde_json::json!({
      "queued": true,
      "id": item.id,
      "message": "Saved offline; will sync when the connection is back",
    });
    Self {
      status: 202,
      content_type: Some("application/json".to_string()),
      body: body.to_string(),
      source: ResponseSource::Queued,
      cached_at: None,
    }
  }

  pub fn offline_fallback() -> Self {
    Self {
      status: 503,
      content_type: Some("text/html; charset=utf-8".to_string()),
      body: OFFLINE_DOCUMENT.to_string(),
      source: ResponseSource::OfflineFallback,
      cached_at: None,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub max_retries: u32,
  pub data_ttl: TtlDuration,
  pub page_ttl: TtlDuration,
  pub page_timeout: Duration,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      max_retries: crate::queue::MAX_RETRIES,
      data_ttl: TtlDuration::hours(24),
      page_ttl: TtlDuration::days(7),
      page_timeout: Duration::from_secs(3),
    }
  }
}

impl EngineOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      max_retries: config.sync.max_retries,
      data_ttl: TtlDuration::seconds(config.cache.ttl_secs),
      page_ttl: TtlDuration::seconds(config.cache.page_ttl_secs),
      page_timeout: Duration::from_millis(config.sync.page_timeout_ms),
    }
  }
}

/// The offline-first request engine.
pub struct SyncEngine {
  network: Arc<dyn Network>,
  data: Arc<CacheStore>,
  pages: Arc<CacheStore>,
  queue: Arc<MutationQueue>,
  routes: RouteTable,
  views: ViewRegistry,
  page_timeout: Duration,
  /// Background refreshes and late page fetches still running
  tasks: Mutex<JoinSet<()>>,
  /// Cache keys with a background refresh in flight
  refreshing: Arc<Mutex<HashSet<String>>>,
}

impl SyncEngine {
  pub fn new(
    network: Arc<dyn Network>,
    storage: Arc<dyn KvStorage>,
    routes: RouteTable,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
  ) -> Result<Self> {
    let data = CacheStore::new(storage.clone(), DATA_NAMESPACE, clock.clone())
      .with_default_ttl(options.data_ttl);
    let pages = CacheStore::new(storage.clone(), PAGE_NAMESPACE, clock.clone())
      .with_default_ttl(options.page_ttl);
    let queue = MutationQueue::open(storage, clock)?.with_max_retries(options.max_retries);

    Ok(Self {
      network,
      data: Arc::new(data),
      pages: Arc::new(pages),
      queue: Arc::new(queue),
      routes,
      views: ViewRegistry::new(),
      page_timeout: options.page_timeout,
      tasks: Mutex::new(JoinSet::new()),
      refreshing: Arc::new(Mutex::new(HashSet::new())),
    })
  }

  pub fn cache(&self) -> &CacheStore {
    &self.data
  }

  pub fn pages(&self) -> &CacheStore {
    &self.pages
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn routes(&self) -> &RouteTable {
    &self.routes
  }

  pub fn views(&self) -> &ViewRegistry {
    &self.views
  }

  /// Serve a request with the strategy its route maps to.
  pub async fn handle(&self, request: Request) -> Result<Response> {
    let strategy = self.routes.strategy_for(&request);
    debug!(method = %request.method, url = %request.url, ?strategy, "handling request");

    match strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
      Strategy::NetworkOnly => self
        .network
        .request(&request)
        .await
        .map(Response::from_network),
    }
  }

  /// 1. Valid cache hit: return it, refresh in the background
  /// 2. Miss: fetch, cache on success
  /// 3. Miss and no network: `OfflineNoData`
  async fn cache_first(&self, request: Request) -> Result<Response> {
    let key = request.cache_key().to_string();

    if let Some(entry) = self.data.get(&key)? {
      self.spawn_refresh(request);
      return Ok(Response::from_cache(&entry));
    }

    let since = self.data.generation();
    match self.network.request(&request).await {
      Ok(response) => {
        if response.is_success() {
          store(&self.data, &key, &response, since);
        }
        Ok(Response::from_network(response))
      }
      Err(e) => {
        debug!(key = %key, error = %e, "cache miss and network unavailable");
        Err(SyncError::OfflineNoData { key })
      }
    }
  }

  /// Try the network; on failure queue the write and answer "accepted".
  async fn network_first(&self, request: Request) -> Result<Response> {
    match self.network.request(&request).await {
      Ok(response) => {
        // The backend applied the write; a failed eviction must not turn
        // that into an error the caller might retry
        if response.is_success() {
          if let Err(e) = self.invalidate(&request.url) {
            warn!(url = %request.url, error = %e, "failed to invalidate cache after write");
          }
        }
        Ok(Response::from_network(response))
      }
      Err(e) => {
        warn!(method = %request.method, url = %request.url, error = %e, "write failed, queueing for replay");
        let item = self.queue.enqueue(&request)?;
        Ok(Response::queued(&item))
      }
    }
  }

  /// Network with a deadline; the last cached page (or the offline page)
  /// after it. A fetch that beats nobody still updates the cache when it
  /// lands.
  async fn stale_while_revalidate(&self, request: Request) -> Result<Response> {
    let key = request.cache_key().to_string();
    let (tx, rx) = oneshot::channel();
    let network = self.network.clone();
    let pages = self.pages.clone();
    let page_key = key.clone();
    let since = pages.generation();

    self.spawn_task(async move {
      let result = network.request(&request).await;
      if let Ok(response) = &result {
        if response.is_success() {
          store(&pages, &page_key, response, since);
        }
      }
      // Caller may have timed out already
      let _ = tx.send(result);
    });

    match tokio::time::timeout(self.page_timeout, rx).await {
      Ok(Ok(Ok(response))) => Ok(Response::from_network(response)),
      Ok(Ok(Err(e))) => {
        debug!(key = %key, error = %e, "page fetch failed, serving fallback");
        self.page_fallback(&key)
      }
      Ok(Err(_)) => self.page_fallback(&key),
      Err(_) => {
        debug!(key = %key, timeout = ?self.page_timeout, "page fetch timed out, serving fallback");
        self.page_fallback(&key)
      }
    }
  }

  fn page_fallback(&self, key: &str) -> Result<Response> {
    Ok(match self.pages.get(key)? {
      Some(entry) => Response::from_cache(&entry),
      None => Response::offline_fallback(),
    })
  }

  fn spawn_task<F>(&self, task: F)
  where
    F: std::future::Future<Output = ()> + Send + 'static,
  {
    let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
    // Reap finished tasks so the set does not grow without bound
    while tasks.try_join_next().is_some() {}
    tasks.spawn(task);
  }

  /// Refresh a cached read without making anyone wait for it. At most one
  /// refresh per key is in flight.
  fn spawn_refresh(&self, request: Request) {
    let key = request.cache_key().to_string();
    {
      let mut refreshing = self.refreshing.lock().unwrap_or_else(|e| e.into_inner());
      if !refreshing.insert(key.clone()) {
        debug!(key = %key, "refresh already in flight");
        return;
      }
    }

    let network = self.network.clone();
    let data = self.data.clone();
    let views = self.views.clone();
    let refreshing = self.refreshing.clone();
    let since = data.generation();

    self.spawn_task(async move {
      match network.request(&request).await {
        Ok(response) if response.is_success() => {
          // Data fetched before a write to its family is already stale
          if store(&data, &key, &response, since) {
            views.publish(&key, &Response::from_network(response));
          }
        }
        Ok(response) => {
          debug!(key = %key, status = response.status, "background refresh returned non-success, keeping cache");
        }
        Err(e) => {
          debug!(key = %key, error = %e, "background refresh failed, keeping cache");
        }
      }
      refreshing
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&key);
    });
  }

  /// Wait for every background refresh and late page fetch to finish.
  pub async fn settle(&self) {
    loop {
      let mut tasks = {
        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
      };
      if tasks.is_empty() {
        return;
      }
      while tasks.join_next().await.is_some() {}
    }
  }

  /// Evict the cache family a written URL belongs to.
  pub fn invalidate(&self, url: &str) -> Result<Vec<String>> {
    let family = self.routes.family_of(url);
    self.data.evict_family(&family)
  }

  /// Replay queued writes.
  pub async fn drain(&self) -> Result<DrainReport> {
    self.queue.drain(self.network.as_ref()).await
  }

  /// Re-read every bound view in the given route families and publish the
  /// results. Returns how many URLs were refreshed.
  pub async fn refresh_views(&self, families: &[String]) -> usize {
    let urls = self.views.urls_in_families(families);
    let reads = urls.iter().map(|url| self.handle(Request::get(url.clone())));
    let results = join_all(reads).await;

    let mut refreshed = 0;
    for (url, result) in urls.iter().zip(results) {
      match result {
        Ok(response) => {
          self.views.publish(url, &response);
          refreshed += 1;
        }
        Err(e) => debug!(url = %url, error = %e, "view refresh failed"),
      }
    }

    if refreshed > 0 {
      info!(refreshed, "refreshed displayed views");
    }
    refreshed
  }
}

/// Cache a successful response fetched at generation `since`, evicting older
/// entries if storage is full. Returns whether it was stored. A failure to
/// cache never fails the read that produced the data.
fn store(cache: &CacheStore, key: &str, response: &NetResponse, since: u64) -> bool {
  match cache.set_unless_invalidated(key, response.clone().into(), cache.default_ttl(), since) {
    Ok(stored) => stored.is_some(),
    Err(e) => {
      warn!(key, error = %e, "failed to cache response");
      false
    }
  }
}
