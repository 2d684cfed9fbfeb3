//! Reconciles local state when the connection comes back.
//!
//! On an offline -> online edge the coordinator waits out a debounce window,
//! drains the mutation queue, evicts the cache families the replayed writes
//! touched, refreshes any views showing those families and tells the user how
//! it went. Items that failed but still have retries left are re-drained with
//! exponential backoff while the connection holds.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, Subscription, Transition};
use crate::engine::SyncEngine;
use crate::error::Result;
use crate::notify::{LostWrite, Notifier, StatusIndicator};

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
  /// Quiet period after reconnecting before syncing starts
  pub debounce: Duration,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
}

impl Default for CoordinatorOptions {
  fn default() -> Self {
    Self {
      debounce: Duration::from_secs(2),
      backoff_base: Duration::from_secs(1),
      backoff_max: Duration::from_secs(30),
    }
  }
}

impl CoordinatorOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      debounce: Duration::from_millis(config.sync.debounce_ms),
      backoff_base: Duration::from_millis(config.sync.backoff_base_ms),
      backoff_max: Duration::from_millis(config.sync.backoff_max_ms),
    }
  }

  /// Delay before the retry pass numbered `attempt` (0-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    self.backoff_base.saturating_mul(factor).min(self.backoff_max)
  }
}

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
  pub replayed: usize,
  pub retrying: usize,
  pub lost: Vec<LostWrite>,
  pub evicted: Vec<String>,
  pub refreshed: usize,
}

enum Debounce {
  Settled,
  WentOffline,
  Closed,
}

pub struct SyncCoordinator {
  engine: Arc<SyncEngine>,
  monitor: ConnectivityMonitor,
  notifier: Arc<dyn Notifier>,
  options: CoordinatorOptions,
}

impl SyncCoordinator {
  pub fn new(
    engine: Arc<SyncEngine>,
    monitor: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
    options: CoordinatorOptions,
  ) -> Self {
    Self {
      engine,
      monitor,
      notifier,
      options,
    }
  }

  /// Start reacting to transitions. The subscription is taken before this
  /// returns, so any transition signalled afterwards is seen.
  pub fn spawn(self) -> JoinHandle<()> {
    let subscription = self.monitor.subscribe();
    tokio::spawn(self.run(subscription))
  }

  async fn run(self, mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
      match event.transition {
        Transition::WentOffline => {
          self.notifier.notify(StatusIndicator::Offline);
        }
        Transition::WentOnline => match self.debounce(&mut subscription).await {
          Debounce::Settled => {
            if !self.sync_with_backoff(&mut subscription).await {
              return;
            }
          }
          Debounce::WentOffline => {
            info!("connection dropped during debounce, sync skipped");
            self.notifier.notify(StatusIndicator::Offline);
          }
          Debounce::Closed => return,
        },
      }
    }
  }

  async fn debounce(&self, subscription: &mut Subscription) -> Debounce {
    tokio::select! {
      _ = tokio::time::sleep(self.options.debounce) => Debounce::Settled,
      // Edges alternate, so the only thing that can follow "online" is "offline"
      event = subscription.recv() => match event {
        Some(_) => Debounce::WentOffline,
        None => Debounce::Closed,
      },
    }
  }

  /// Sync, then keep retrying with backoff while items are retryable and the
  /// connection holds. Returns `false` if the monitor went away.
  async fn sync_with_backoff(&self, subscription: &mut Subscription) -> bool {
    let mut attempt = 0;
    loop {
      let summary = match self.sync_now().await {
        Ok(summary) => summary,
        Err(e) => {
          warn!(error = %e, "sync failed");
          return true;
        }
      };
      if summary.retrying == 0 || !self.monitor.is_online() {
        return true;
      }

      let delay = self.options.backoff(attempt);
      attempt += 1;
      info!(retrying = summary.retrying, ?delay, "retrying queued writes after backoff");

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        event = subscription.recv() => match event {
          Some(_) => {
            self.notifier.notify(StatusIndicator::Offline);
            return true;
          }
          None => return false,
        },
      }
    }
  }

  /// One pass: drain, evict touched families, refresh views, notify.
  pub async fn sync_now(&self) -> Result<SyncSummary> {
    let pending = self.engine.queue().size();
    if pending > 0 {
      self.notifier.notify(StatusIndicator::Syncing { pending });
    }

    let report = self.engine.drain().await?;

    let families: BTreeSet<String> = report
      .replayed()
      .map(|item| self.engine.routes().family_of(&item.url))
      .collect();
    let families: Vec<String> = families.into_iter().collect();

    // Lost writes must still be reported if eviction fails
    let mut evicted = Vec::new();
    for family in &families {
      match self.engine.cache().evict_family(family) {
        Ok(keys) => evicted.extend(keys),
        Err(e) => warn!(family = %family, error = %e, "failed to evict cache family after sync"),
      }
    }
    let refreshed = self.engine.refresh_views(&families).await;

    let summary = SyncSummary {
      replayed: report.replayed().count(),
      retrying: report.retrying(),
      lost: report.lost().map(LostWrite::from).collect(),
      evicted,
      refreshed,
    };

    info!(
      replayed = summary.replayed,
      retrying = summary.retrying,
      lost = summary.lost.len(),
      evicted = summary.evicted.len(),
      "sync pass finished"
    );

    if !summary.lost.is_empty() {
      self.notifier.notify(StatusIndicator::SyncFailed {
        items: summary.lost.clone(),
      });
    } else if summary.retrying == 0 {
      self.notifier.notify(StatusIndicator::BackOnline);
    }

    Ok(summary)
  }
}
