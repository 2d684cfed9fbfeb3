//! Durable queue of writes that could not reach the backend.
//!
//! The whole queue lives under a single storage key. Every change is an
//! atomic read-modify-write of that key, so an item is on disk before
//! `enqueue` returns and concurrent writers never drop each other's items.
//! Draining replays a snapshot in FIFO order; only one drain runs at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::network::{Method, Network, Request};
use crate::storage::KvStorage;

/// Storage key holding the serialized queue.
pub const QUEUE_KEY: &str = "offline_queue";

/// Failed replays tolerated before an item is abandoned.
pub const MAX_RETRIES: u32 = 3;

/// Header carrying the item id on replay, so the backend can drop duplicates.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Header carrying the original enqueue time on replay.
pub const QUEUED_AT_HEADER: &str = "X-Offline-Queued-At";

/// A write waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
  pub id: String,
  pub url: String,
  pub method: Method,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub headers: Vec<(String, String)>,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

impl QueueItem {
  /// The request sent when replaying this item.
  pub fn replay_request(&self) -> Request {
    let mut request = Request::new(self.method, self.url.clone());
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    request
      .with_header(IDEMPOTENCY_HEADER, self.id.clone())
      .with_header(QUEUED_AT_HEADER, self.enqueued_at.to_rfc3339())
  }
}

/// What happened to one item during a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayResult {
  /// The backend accepted the write; the item is gone.
  Replayed { status: u16 },
  /// Replay failed; the item stays queued with this retry count.
  Retrying { retry_count: u32, error: String },
  /// Replay failed past the retry ceiling; the item was dropped.
  RetryExhausted { attempts: u32, error: String },
  /// The backend refused the write outright (4xx); the item was dropped.
  Rejected { status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
  pub item: QueueItem,
  pub result: ReplayResult,
  /// Set when the result could not be written back to the queue; the item
  /// may then be seen again on the next drain.
  pub storage_error: Option<String>,
}

impl ReplayOutcome {
  /// Whether the write was dropped without being applied.
  pub fn is_lost(&self) -> bool {
    matches!(
      self.result,
      ReplayResult::RetryExhausted { .. } | ReplayResult::Rejected { .. }
    )
  }

  /// The lost write as an error, for callers that surface it.
  pub fn to_error(&self) -> Option<SyncError> {
    match &self.result {
      ReplayResult::RetryExhausted { attempts, .. } => Some(SyncError::RetryExhausted {
        method: self.item.method.to_string(),
        url: self.item.url.clone(),
        attempts: *attempts,
      }),
      _ => None,
    }
  }
}

/// Per-item results of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub outcomes: Vec<ReplayOutcome>,
  /// Items still queued when the pass finished (including ones enqueued during it).
  pub pending: usize,
}

impl DrainReport {
  pub fn replayed(&self) -> impl Iterator<Item = &QueueItem> {
    self
      .outcomes
      .iter()
      .filter(|o| matches!(o.result, ReplayResult::Replayed { .. }))
      .map(|o| &o.item)
  }

  pub fn lost(&self) -> impl Iterator<Item = &ReplayOutcome> {
    self.outcomes.iter().filter(|o| o.is_lost())
  }

  pub fn retrying(&self) -> usize {
    self
      .outcomes
      .iter()
      .filter(|o| matches!(o.result, ReplayResult::Retrying { .. }))
      .count()
  }
}

/// Persistent FIFO of pending writes.
///
/// Storage is the only copy of the queue: every change re-reads it and writes
/// it back in one atomic storage update, so several handles (or processes)
/// sharing a backend never overwrite each other's items.
pub struct MutationQueue {
  storage: Arc<dyn KvStorage>,
  clock: Arc<dyn Clock>,
  /// Held for the whole of a drain pass
  drain_lock: tokio::sync::Mutex<()>,
  max_retries: u32,
  seq: AtomicU64,
  /// Length seen on the last successful read or write
  last_size: AtomicUsize,
}

fn decode(json: Option<String>) -> Result<Vec<QueueItem>> {
  match json {
    Some(json) => Ok(serde_json::from_str(&json)?),
    None => Ok(Vec::new()),
  }
}

impl MutationQueue {
  /// Open the queue persisted in `storage`, if any.
  pub fn open(storage: Arc<dyn KvStorage>, clock: Arc<dyn Clock>) -> Result<Self> {
    let queue = Self {
      storage,
      clock,
      drain_lock: tokio::sync::Mutex::new(()),
      max_retries: MAX_RETRIES,
      seq: AtomicU64::new(0),
      last_size: AtomicUsize::new(0),
    };
    let pending = queue.load()?.len();
    if pending > 0 {
      info!(pending, "loaded offline queue");
    }
    Ok(queue)
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  fn load(&self) -> Result<Vec<QueueItem>> {
    let items = decode(self.storage.get(QUEUE_KEY)?)?;
    self.last_size.store(items.len(), Ordering::SeqCst);
    Ok(items)
  }

  /// Load-modify-store the persisted queue. If the store fails nothing
  /// changes and the error is returned.
  fn modify<T>(&self, mut change: impl FnMut(&mut Vec<QueueItem>) -> T) -> Result<T> {
    let mut output = None;
    let mut len = 0;
    self.storage.update(QUEUE_KEY, &mut |current| {
      let mut items = decode(current)?;
      output = Some(change(&mut items));
      len = items.len();
      Ok(Some(serde_json::to_string(&items)?))
    })?;
    self.last_size.store(len, Ordering::SeqCst);
    output.ok_or_else(|| SyncError::Storage("queue update was not applied".to_string()))
  }

  fn next_id(&self, request: &Request, at: DateTime<Utc>) -> String {
    let seq = self.seq.fetch_add(1, Ordering::SeqCst);
    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(request.url.as_bytes());
    hasher.update(request.body.as_deref().unwrap_or_default().as_bytes());
    hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(seq.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
  }

  /// Append a write. The item is persisted before this returns; if that
  /// fails the queue is left unchanged and the error is returned.
  pub fn enqueue(&self, request: &Request) -> Result<QueueItem> {
    let enqueued_at = self.clock.now();
    let item = QueueItem {
      id: self.next_id(request, enqueued_at),
      url: request.url.clone(),
      method: request.method,
      body: request.body.clone(),
      headers: request.headers.clone(),
      enqueued_at,
      retry_count: 0,
    };

    let pending = self.modify(|items| {
      items.push(item.clone());
      items.len()
    })?;

    info!(id = %item.id, method = %item.method, url = %item.url, pending, "queued write");
    Ok(item)
  }

  /// Pending items. If storage cannot be read, the last length seen.
  pub fn size(&self) -> usize {
    match self.load() {
      Ok(items) => items.len(),
      Err(e) => {
        warn!(error = %e, "failed to read offline queue, reporting last known size");
        self.last_size.load(Ordering::SeqCst)
      }
    }
  }

  pub fn is_empty(&self) -> bool {
    self.size() == 0
  }

  /// Snapshot of the pending items in replay order.
  pub fn items(&self) -> Result<Vec<QueueItem>> {
    let mut items = self.load()?;
    items.sort_by_key(|item| item.enqueued_at);
    Ok(items)
  }

  /// Drop every pending item, returning how many were discarded.
  pub fn clear(&self) -> Result<usize> {
    self.modify(|items| {
      let count = items.len();
      items.clear();
      count
    })
  }

  /// Replay pending writes through `network`.
  ///
  /// Only items persisted when the pass starts are replayed. A drain started
  /// while another is running waits for it and then sees what is left.
  /// Individual failures are reported in the result, never returned as
  /// errors; that includes failing to record a replay's result in storage.
  pub async fn drain(&self, network: &dyn Network) -> Result<DrainReport> {
    let _guard = self.drain_lock.lock().await;
    let snapshot = self.items()?;
    let mut report = DrainReport::default();

    if !snapshot.is_empty() {
      info!(count = snapshot.len(), "draining offline queue");
    }

    for item in snapshot {
      let (result, recorded) = match network.request(&item.replay_request()).await {
        Ok(response) if response.is_success() => {
          debug!(id = %item.id, status = response.status, "replayed queued write");
          let result = ReplayResult::Replayed {
            status: response.status,
          };
          (result, self.remove(&item.id))
        }
        Ok(response) if is_retryable(response.status) => {
          self.record_failure(&item, format!("HTTP {}", response.status))
        }
        Ok(response) => {
          warn!(id = %item.id, method = %item.method, url = %item.url, status = response.status, "backend rejected queued write");
          let result = ReplayResult::Rejected {
            status: response.status,
          };
          (result, self.remove(&item.id))
        }
        Err(e) => self.record_failure(&item, e.to_string()),
      };

      let storage_error = match recorded {
        Ok(()) => None,
        Err(e) => {
          warn!(id = %item.id, error = %e, "failed to record replay result in the queue");
          Some(e.to_string())
        }
      };
      report.outcomes.push(ReplayOutcome {
        item,
        result,
        storage_error,
      });
    }

    report.pending = self.size();
    Ok(report)
  }

  fn remove(&self, id: &str) -> Result<()> {
    self.modify(|items| items.retain(|item| item.id != id))
  }

  /// Count a failed replay against the item. The result is decided even if
  /// storage cannot be updated, so the caller can still report it.
  fn record_failure(&self, item: &QueueItem, error: String) -> (ReplayResult, Result<()>) {
    let max_retries = self.max_retries;
    let recorded = self.modify(|items: &mut Vec<QueueItem>| -> Option<u32> {
      let pos = items.iter().position(|i| i.id == item.id)?;
      let attempts = items[pos].retry_count + 1;
      if attempts > max_retries {
        items.remove(pos);
      } else {
        items[pos].retry_count = attempts;
      }
      Some(attempts)
    });

    let (attempts, recorded) = match recorded {
      Ok(Some(attempts)) => (attempts, Ok(())),
      // Gone from storage while the replay was in flight (cleared, or
      // replayed through another handle)
      Ok(None) => {
        return (
          ReplayResult::Retrying {
            retry_count: item.retry_count,
            error,
          },
          Ok(()),
        )
      }
      Err(e) => (item.retry_count + 1, Err(e)),
    };

    let result = if attempts > max_retries {
      warn!(id = %item.id, method = %item.method, url = %item.url, attempts, %error, "dropping queued write after retry ceiling");
      ReplayResult::RetryExhausted { attempts, error }
    } else {
      debug!(id = %item.id, retry = attempts, max = max_retries, %error, "queued write replay failed");
      ReplayResult::Retrying {
        retry_count: attempts,
        error,
      }
    };
    (result, recorded)
  }
}

/// Statuses that mean "try again later" rather than "no".
fn is_retryable(status: u16) -> bool {
  status == 408 || status == 429 || status >= 500
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::{ManualClock, SystemClock};
  use crate::network::fake::FakeNetwork;
  use crate::storage::flaky::FlakyStorage;
  use crate::storage::MemoryStorage;
  use std::time::Duration;

  fn open(storage: &Arc<MemoryStorage>) -> MutationQueue {
    MutationQueue::open(storage.clone(), Arc::new(SystemClock)).unwrap()
  }

  fn patch(url: &str) -> Request {
    Request::new(Method::Patch, url).with_body(r#"{"present":true}"#)
  }

  #[test]
  fn test_enqueue_persists_before_returning() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = open(&storage);

    let item = queue.enqueue(&patch("/api/subjects/42/attendance")).unwrap();
    assert_eq!(item.retry_count, 0);
    assert_eq!(queue.size(), 1);

    let persisted: Vec<QueueItem> =
      serde_json::from_str(&storage.get(QUEUE_KEY).unwrap().unwrap()).unwrap();
    assert_eq!(persisted, vec![item]);
  }

  #[test]
  fn test_enqueue_failure_leaves_queue_unchanged() {
    let storage = Arc::new(MemoryStorage::with_quota(8));
    let queue = MutationQueue::open(storage, Arc::new(SystemClock)).unwrap();

    let err = queue.enqueue(&patch("/api/subjects/1")).unwrap_err();
    assert!(matches!(err, SyncError::StorageQuotaExceeded { .. }));
    assert_eq!(queue.size(), 0);
  }

  #[tokio::test]
  async fn test_queue_survives_restart() {
    let storage = Arc::new(MemoryStorage::new());
    {
      let queue = open(&storage);
      queue.enqueue(&patch("/api/subjects/42/attendance")).unwrap();
    }

    let queue = open(&storage);
    assert_eq!(queue.size(), 1);

    let network = FakeNetwork::new();
    network.respond(Method::Patch, "/api/subjects/42/attendance", 200, "{}");
    let report = queue.drain(&network).await.unwrap();

    assert_eq!(report.replayed().count(), 1);
    assert_eq!(report.pending, 0);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_retry_ceiling() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = open(&storage);
    queue.enqueue(&patch("/api/tasks/7")).unwrap();

    let network = FakeNetwork::new();
    network.set_online(false);

    for attempt in 1..=MAX_RETRIES {
      let report = queue.drain(&network).await.unwrap();
      assert_eq!(report.outcomes.len(), 1);
      assert!(matches!(
        report.outcomes[0].result,
        ReplayResult::Retrying { retry_count, .. } if retry_count == attempt
      ));
      assert_eq!(queue.items().unwrap()[0].retry_count, attempt);
    }

    let report = queue.drain(&network).await.unwrap();
    let lost: Vec<_> = report.lost().collect();
    assert_eq!(lost.len(), 1);
    assert!(matches!(
      lost[0].result,
      ReplayResult::RetryExhausted { attempts, .. } if attempts == MAX_RETRIES + 1
    ));
    assert!(matches!(
      lost[0].to_error(),
      Some(SyncError::RetryExhausted { attempts: 4, .. })
    ));
    assert!(queue.is_empty());

    // Never replayed again
    let report = queue.drain(&network).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(network.calls_to(Method::Patch, "/api/tasks/7"), 4);
  }

  #[tokio::test]
  async fn test_concurrent_drains_replay_once() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = open(&storage);
    queue.enqueue(&patch("/api/a/1")).unwrap();
    queue.enqueue(&patch("/api/b/2")).unwrap();

    let network = FakeNetwork::new();
    network.set_delay(Duration::from_millis(20));
    network.respond(Method::Patch, "/api/a/1", 200, "{}");
    network.respond(Method::Patch, "/api/b/2", 200, "{}");

    let (first, second) = tokio::join!(queue.drain(&network), queue.drain(&network));
    let total = first.unwrap().outcomes.len() + second.unwrap().outcomes.len();

    assert_eq!(total, 2);
    assert_eq!(network.calls_to(Method::Patch, "/api/a/1"), 1);
    assert_eq!(network.calls_to(Method::Patch, "/api/b/2"), 1);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_replay_is_fifo_by_enqueue_time() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::default());
    let queue = MutationQueue::open(storage, clock.clone()).unwrap();
    for url in ["/api/x/1", "/api/x/2", "/api/x/3"] {
      queue.enqueue(&patch(url)).unwrap();
      clock.advance(chrono::Duration::seconds(1));
    }

    let network = FakeNetwork::new();
    for url in ["/api/x/1", "/api/x/2", "/api/x/3"] {
      network.respond(Method::Patch, url, 204, "");
    }
    queue.drain(&network).await.unwrap();

    let order: Vec<String> = network.calls().into_iter().map(|r| r.url).collect();
    assert_eq!(order, vec!["/api/x/1", "/api/x/2", "/api/x/3"]);
  }

  #[tokio::test]
  async fn test_replay_carries_idempotency_key() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = open(&storage);
    let item = queue
      .enqueue(&patch("/api/x/1").with_header("Authorization", "Bearer t"))
      .unwrap();

    let network = FakeNetwork::new();
    network.respond(Method::Patch, "/api/x/1", 200, "{}");
    queue.drain(&network).await.unwrap();

    let sent = &network.calls()[0];
    assert_eq!(sent.body.as_deref(), Some(r#"{"present":true}"#));
    assert!(sent
      .headers
      .contains(&("Authorization".to_string(), "Bearer t".to_string())));
    assert!(sent
      .headers
      .contains(&(IDEMPOTENCY_HEADER.to_string(), item.id.clone())));
    assert!(sent.headers.iter().any(|(k, _)| k == QUEUED_AT_HEADER));
  }

  #[tokio::test]
  async fn test_client_error_rejects_and_server_error_retries() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = open(&storage);
    queue.enqueue(&patch("/api/conflict/1")).unwrap();
    queue.enqueue(&patch("/api/flaky/1")).unwrap();

    let network = FakeNetwork::new();
    network.respond(Method::Patch, "/api/conflict/1", 409, "stale");
    network.respond(Method::Patch, "/api/flaky/1", 503, "busy");

    let report = queue.drain(&network).await.unwrap();
    assert_eq!(report.lost().count(), 1);
    assert_eq!(report.retrying(), 1);
    assert!(matches!(
      report.outcomes[0].result,
      ReplayResult::Rejected { status: 409 }
    ));
    assert_eq!(report.pending, 1);
    assert_eq!(queue.items().unwrap()[0].url, "/api/flaky/1");
  }

  #[tokio::test]
  async fn test_enqueue_during_drain_waits_for_next_pass() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = Arc::new(open(&storage));
    queue.enqueue(&patch("/api/x/1")).unwrap();

    let network = Arc::new(FakeNetwork::new());
    network.set_delay(Duration::from_millis(50));
    network.respond(Method::Patch, "/api/x/1", 200, "{}");

    let drain = {
      let queue = queue.clone();
      let network = network.clone();
      tokio::spawn(async move { queue.drain(network.as_ref()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.enqueue(&patch("/api/x/2")).unwrap();

    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.pending, 1);
    assert_eq!(network.calls_to(Method::Patch, "/api/x/2"), 0);
  }

  #[tokio::test]
  async fn test_handles_sharing_storage_keep_each_others_items() {
    let storage = Arc::new(MemoryStorage::new());
    let watcher = open(&storage);
    let sender = open(&storage);

    watcher.enqueue(&patch("/api/a/1")).unwrap();
    sender.enqueue(&patch("/api/b/2")).unwrap();
    assert_eq!(watcher.size(), 2);

    let network = FakeNetwork::new();
    network.respond(Method::Patch, "/api/a/1", 200, "{}");
    network.respond(Method::Patch, "/api/b/2", 200, "{}");

    // The drain sees the item enqueued through the other handle
    let report = watcher.drain(&network).await.unwrap();
    assert_eq!(report.replayed().count(), 2);
    assert_eq!(network.calls_to(Method::Patch, "/api/b/2"), 1);
    assert!(sender.is_empty());
  }

  #[tokio::test]
  async fn test_removing_replayed_item_keeps_newer_ones() {
    let storage = Arc::new(MemoryStorage::new());
    let watcher = open(&storage);
    let sender = open(&storage);
    watcher.enqueue(&patch("/api/a/1")).unwrap();

    let network = Arc::new(FakeNetwork::new());
    network.set_delay(Duration::from_millis(50));
    network.respond(Method::Patch, "/api/a/1", 200, "{}");

    let watcher = Arc::new(watcher);
    let drain = {
      let watcher = watcher.clone();
      let network = network.clone();
      tokio::spawn(async move { watcher.drain(network.as_ref()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let late = sender.enqueue(&patch("/api/b/2")).unwrap();

    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.replayed().count(), 1);
    assert_eq!(report.pending, 1);
    assert_eq!(sender.items().unwrap(), vec![late]);
  }

  #[tokio::test]
  async fn test_lost_write_reported_when_queue_cannot_be_updated() {
    let storage = Arc::new(FlakyStorage::new());
    let queue = MutationQueue::open(storage.clone(), Arc::new(SystemClock))
      .unwrap()
      .with_max_retries(0);
    queue.enqueue(&patch("/api/tasks/7")).unwrap();

    let network = FakeNetwork::new();
    network.set_online(false);
    storage.fail_writes(true);

    let report = queue.drain(&network).await.unwrap();
    let lost: Vec<_> = report.lost().collect();
    assert_eq!(lost.len(), 1);
    assert!(matches!(
      lost[0].result,
      ReplayResult::RetryExhausted { attempts: 1, .. }
    ));
    assert!(lost[0].storage_error.is_some());
  }

  #[test]
  fn test_size_falls_back_to_last_known_when_unreadable() {
    let storage = Arc::new(FlakyStorage::new());
    let queue = MutationQueue::open(storage.clone(), Arc::new(SystemClock)).unwrap();
    queue.enqueue(&patch("/api/a/1")).unwrap();
    queue.enqueue(&patch("/api/a/2")).unwrap();

    storage.fail_reads(true);
    assert_eq!(queue.size(), 2);
    assert!(queue.items().is_err());
  }
}
