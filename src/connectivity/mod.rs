//! Online/offline tracking.
//!
//! The monitor is a two-state machine fed by platform signals. Only edges
//! produce events: a second "online" while online is ignored. Each event goes
//! to every subscriber registered at the time it fires, exactly once.

mod probe;

pub use probe::ReachabilityProbe;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::Clock;

/// Coarse connection speed, in the buckets browsers report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EffectiveType {
  #[serde(rename = "slow-2g")]
  Slow2g,
  #[serde(rename = "2g")]
  TwoG,
  #[serde(rename = "3g")]
  ThreeG,
  #[serde(rename = "4g")]
  FourG,
}

impl fmt::Display for EffectiveType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EffectiveType::Slow2g => write!(f, "slow-2g"),
      EffectiveType::TwoG => write!(f, "2g"),
      EffectiveType::ThreeG => write!(f, "3g"),
      EffectiveType::FourG => write!(f, "4g"),
    }
  }
}

/// Best-effort link quality. Absent when the platform does not report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkQuality {
  pub effective_type: EffectiveType,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rtt_ms: Option<u64>,
}

impl LinkQuality {
  /// Bucket a measured round trip the way the Network Information API does.
  pub fn from_rtt(rtt: Duration) -> Self {
    let rtt_ms = rtt.as_millis() as u64;
    let effective_type = match rtt_ms {
      2000.. => EffectiveType::Slow2g,
      1400.. => EffectiveType::TwoG,
      270.. => EffectiveType::ThreeG,
      _ => EffectiveType::FourG,
    };
    Self {
      effective_type,
      rtt_ms: Some(rtt_ms),
    }
  }
}

/// Current view of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
  pub is_online: bool,
  pub last_online_at: Option<DateTime<Utc>>,
  pub last_offline_at: Option<DateTime<Utc>>,
  pub link_quality: Option<LinkQuality>,
}

/// Raw input from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
  Online,
  Offline,
  QualityChanged(LinkQuality),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
}

/// A state edge, as delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityEvent {
  pub transition: Transition,
  pub at: DateTime<Utc>,
  pub link_quality: Option<LinkQuality>,
}

struct Registry {
  state: ConnectivityState,
  subscribers: HashMap<u64, mpsc::UnboundedSender<ConnectivityEvent>>,
  next_id: u64,
}

struct Inner {
  registry: Mutex<Registry>,
  clock: Arc<dyn Clock>,
}

/// Tracks connectivity and fans transitions out to subscribers.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  /// Start in the state the platform reports at startup.
  pub fn new(initially_online: bool, clock: Arc<dyn Clock>) -> Self {
    let now = clock.now();
    let state = ConnectivityState {
      is_online: initially_online,
      last_online_at: initially_online.then_some(now),
      last_offline_at: (!initially_online).then_some(now),
      link_quality: None,
    };
    Self {
      inner: Arc::new(Inner {
        registry: Mutex::new(Registry {
          state,
          subscribers: HashMap::new(),
          next_id: 0,
        }),
        clock,
      }),
    }
  }

  fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
    self
      .inner
      .registry
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }

  pub fn state(&self) -> ConnectivityState {
    self.registry().state.clone()
  }

  pub fn is_online(&self) -> bool {
    self.registry().state.is_online
  }

  /// Feed a platform signal. Returns the event if it caused a transition.
  pub fn signal(&self, signal: PlatformSignal) -> Option<ConnectivityEvent> {
    let now = self.inner.clock.now();
    let mut registry = self.registry();

    let transition = match signal {
      PlatformSignal::QualityChanged(quality) => {
        debug!(effective_type = %quality.effective_type, rtt_ms = ?quality.rtt_ms, "link quality changed");
        registry.state.link_quality = Some(quality);
        return None;
      }
      PlatformSignal::Online if !registry.state.is_online => {
        registry.state.is_online = true;
        registry.state.last_online_at = Some(now);
        Transition::WentOnline
      }
      PlatformSignal::Offline if registry.state.is_online => {
        registry.state.is_online = false;
        registry.state.last_offline_at = Some(now);
        Transition::WentOffline
      }
      _ => return None,
    };

    let event = ConnectivityEvent {
      transition,
      at: now,
      link_quality: registry.state.link_quality,
    };
    info!(?transition, subscribers = registry.subscribers.len(), "connectivity changed");

    // Sending under the lock keeps delivery atomic with respect to subscribe()
    registry
      .subscribers
      .retain(|_, tx| tx.send(event).is_ok());

    Some(event)
  }

  /// Register for future transitions. Nothing that already happened is replayed.
  pub fn subscribe(&self) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = self.registry();
    let id = registry.next_id;
    registry.next_id += 1;
    registry.subscribers.insert(id, tx);

    Subscription {
      id,
      rx,
      monitor: Arc::downgrade(&self.inner),
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.registry().subscribers.len()
  }
}

/// A live registration. Dropping it unsubscribes.
pub struct Subscription {
  id: u64,
  rx: mpsc::UnboundedReceiver<ConnectivityEvent>,
  monitor: Weak<Inner>,
}

impl Subscription {
  /// Wait for the next transition. `None` once the monitor is gone.
  pub async fn recv(&mut self) -> Option<ConnectivityEvent> {
    self.rx.recv().await
  }

  /// Take a transition that has already been delivered, if any.
  pub fn try_recv(&mut self) -> Option<ConnectivityEvent> {
    self.rx.try_recv().ok()
  }

  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.monitor.upgrade() {
      let mut registry = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
      registry.subscribers.remove(&self.id);
    }
  }
}

impl fmt::Debug for ConnectivityMonitor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectivityMonitor")
      .field("state", &self.state())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn monitor(online: bool) -> (ConnectivityMonitor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    (ConnectivityMonitor::new(online, clock.clone()), clock)
  }

  #[test]
  fn test_only_edges_emit() {
    let (monitor, clock) = monitor(true);
    let mut sub = monitor.subscribe();

    assert!(monitor.signal(PlatformSignal::Online).is_none());
    clock.advance(chrono::Duration::seconds(5));
    let event = monitor.signal(PlatformSignal::Offline).unwrap();
    assert_eq!(event.transition, Transition::WentOffline);
    assert!(monitor.signal(PlatformSignal::Offline).is_none());
    assert!(monitor.signal(PlatformSignal::Online).is_some());

    assert_eq!(sub.try_recv().unwrap().transition, Transition::WentOffline);
    assert_eq!(sub.try_recv().unwrap().transition, Transition::WentOnline);
    assert!(sub.try_recv().is_none());

    let state = monitor.state();
    assert!(state.is_online);
    assert_eq!(state.last_offline_at, Some(event.at));
  }

  #[test]
  fn test_every_subscriber_sees_each_transition_once() {
    let (monitor, _) = monitor(false);
    let mut a = monitor.subscribe();
    let mut b = monitor.subscribe();

    monitor.signal(PlatformSignal::Online);

    for sub in [&mut a, &mut b] {
      assert_eq!(sub.try_recv().unwrap().transition, Transition::WentOnline);
      assert!(sub.try_recv().is_none());
    }
  }

  #[test]
  fn test_late_subscriber_only_sees_future_transitions() {
    let (monitor, _) = monitor(true);
    monitor.signal(PlatformSignal::Offline);

    let mut late = monitor.subscribe();
    assert!(late.try_recv().is_none());

    monitor.signal(PlatformSignal::Online);
    assert_eq!(late.try_recv().unwrap().transition, Transition::WentOnline);
  }

  #[test]
  fn test_drop_unsubscribes() {
    let (monitor, _) = monitor(true);
    let sub = monitor.subscribe();
    let other = monitor.subscribe();
    assert_eq!(monitor.subscriber_count(), 2);

    sub.unsubscribe();
    drop(other);
    assert_eq!(monitor.subscriber_count(), 0);
    assert!(monitor.signal(PlatformSignal::Offline).is_some());
  }

  #[test]
  fn test_quality_is_attached_not_emitted() {
    let (monitor, _) = monitor(false);
    let mut sub = monitor.subscribe();

    let quality = LinkQuality::from_rtt(Duration::from_millis(300));
    assert_eq!(quality.effective_type, EffectiveType::ThreeG);
    assert!(monitor.signal(PlatformSignal::QualityChanged(quality)).is_none());
    assert!(sub.try_recv().is_none());

    monitor.signal(PlatformSignal::Online);
    assert_eq!(sub.try_recv().unwrap().link_quality, Some(quality));
  }

  #[test]
  fn test_rtt_buckets() {
    let bucket = |ms| LinkQuality::from_rtt(Duration::from_millis(ms)).effective_type;
    assert_eq!(bucket(50), EffectiveType::FourG);
    assert_eq!(bucket(270), EffectiveType::ThreeG);
    assert_eq!(bucket(1500), EffectiveType::TwoG);
    assert_eq!(bucket(2500), EffectiveType::Slow2g);
  }
}
