//! Registry of data currently on screen.
//!
//! A caller showing the result of a read binds its URL and receives fresh
//! responses when the engine refreshes it. Dropping the binding (navigating
//! away) unbinds; refreshes that finish afterwards are discarded.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

use crate::engine::Response;
use crate::network::cache_key_of;
use crate::router::in_family;

struct BoundView {
  url: String,
  tx: mpsc::UnboundedSender<Response>,
}

#[derive(Default)]
struct Views {
  bound: HashMap<u64, BoundView>,
  next_id: u64,
}

#[derive(Clone, Default)]
pub struct ViewRegistry {
  inner: Arc<Mutex<Views>>,
}

impl ViewRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Views> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Start receiving refreshed responses for `url`. Absolute URLs are bound
  /// by path and query, the same key the cache uses.
  pub fn bind(&self, url: impl Into<String>) -> ViewBinding {
    let url: String = url.into();
    let url = cache_key_of(&url).to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut views = self.lock();
    let id = views.next_id;
    views.next_id += 1;
    views.bound.insert(
      id,
      BoundView {
        url: url.clone(),
        tx,
      },
    );

    ViewBinding {
      id,
      url,
      rx,
      registry: Arc::downgrade(&self.inner),
    }
  }

  /// Distinct bound URLs.
  pub fn bound_urls(&self) -> Vec<String> {
    let urls: BTreeSet<String> = self.lock().bound.values().map(|v| v.url.clone()).collect();
    urls.into_iter().collect()
  }

  /// Distinct bound URLs that belong to any of the route families.
  pub fn urls_in_families(&self, families: &[String]) -> Vec<String> {
    self
      .bound_urls()
      .into_iter()
      .filter(|url| families.iter().any(|family| in_family(url, family)))
      .collect()
  }

  /// Hand a refreshed response to every view bound to `url`. Returns how many
  /// views received it.
  pub fn publish(&self, url: &str, response: &Response) -> usize {
    let url = cache_key_of(url);
    let mut views = self.lock();
    let mut delivered = 0;
    views.bound.retain(|_, view| {
      if view.url != url {
        return true;
      }
      let alive = view.tx.send(response.clone()).is_ok();
      if alive {
        delivered += 1;
      }
      alive
    });
    delivered
  }
}

/// A bound view. Dropping it unbinds.
pub struct ViewBinding {
  id: u64,
  url: String,
  rx: mpsc::UnboundedReceiver<Response>,
  registry: Weak<Mutex<Views>>,
}

impl ViewBinding {
  pub fn url(&self) -> &str {
    &self.url
  }

  /// Wait for the next refreshed response.
  pub async fn changed(&mut self) -> Option<Response> {
    self.rx.recv().await
  }

  /// Take a refreshed response that has already arrived, if any.
  pub fn try_changed(&mut self) -> Option<Response> {
    self.rx.try_recv().ok()
  }
}

impl Drop for ViewBinding {
  fn drop(&mut self) {
    if let Some(inner) = self.registry.upgrade() {
      let mut views = inner.lock().unwrap_or_else(|e| e.into_inner());
      views.bound.remove(&self.id);
    }
  }
}
