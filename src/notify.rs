//! One-way status signals for the user. How they are shown is up to the host.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::queue::{ReplayOutcome, ReplayResult};

/// A write that was dropped without being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostWrite {
  pub method: String,
  pub url: String,
  pub reason: String,
}

impl From<&ReplayOutcome> for LostWrite {
  fn from(outcome: &ReplayOutcome) -> Self {
    let reason = match &outcome.result {
      ReplayResult::RetryExhausted { attempts, error } => {
        format!("gave up after {} attempts: {}", attempts, error)
      }
      ReplayResult::Rejected { status } => format!("rejected by server (HTTP {})", status),
      ReplayResult::Replayed { .. } | ReplayResult::Retrying { .. } => String::new(),
    };
    Self {
      method: outcome.item.method.to_string(),
      url: outcome.item.url.clone(),
      reason,
    }
  }
}

/// Status indicator shown to the user. Every variant can be dismissed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusIndicator {
  Offline,
  Syncing { pending: usize },
  BackOnline,
  /// Queued writes were lost and the user has to acknowledge it.
  SyncFailed { items: Vec<LostWrite> },
}

impl StatusIndicator {
  pub fn is_dismissible(&self) -> bool {
    true
  }
}

impl fmt::Display for StatusIndicator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StatusIndicator::Offline => write!(f, "Offline: changes will be saved and sent later"),
      StatusIndicator::Syncing { pending } => write!(f, "Syncing {} pending change(s)", pending),
      StatusIndicator::BackOnline => write!(f, "Back online"),
      StatusIndicator::SyncFailed { items } => {
        write!(f, "Sync failed for {} item(s)", items.len())
      }
    }
  }
}

/// Delivery of status indicators to whatever renders them.
pub trait Notifier: Send + Sync {
  fn notify(&self, status: StatusIndicator);
}

/// Writes indicators to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, status: StatusIndicator) {
    match &status {
      StatusIndicator::SyncFailed { items } => {
        for item in items {
          warn!(method = %item.method, url = %item.url, reason = %item.reason, "write lost");
        }
        warn!("{}", status);
      }
      _ => info!("{}", status),
    }
  }
}

/// Forwards indicators over a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  tx: mpsc::UnboundedSender<StatusIndicator>,
}

impl ChannelNotifier {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusIndicator>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl Notifier for ChannelNotifier {
  fn notify(&self, status: StatusIndicator) {
    // Receiver may have been dropped
    let _ = self.tx.send(status);
  }
}
