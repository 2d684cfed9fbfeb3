//! Scripted network for tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Method, NetResponse, Network, Request};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
enum Reply {
  Respond(NetResponse),
  Fail,
}

/// Network double. Replies are keyed by `"METHOD /path"`; one-shot replies are
/// used before the sticky reply for the same key. Unknown routes answer 404.
#[derive(Debug)]
pub(crate) struct FakeNetwork {
  online: AtomicBool,
  once: Mutex<HashMap<String, VecDeque<Reply>>>,
  sticky: Mutex<HashMap<String, Reply>>,
  calls: Mutex<Vec<Request>>,
  completed: AtomicUsize,
  delay: Mutex<Duration>,
}

fn route_key(method: Method, path: &str) -> String {
  format!("{} {}", method, path)
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      once: Mutex::new(HashMap::new()),
      sticky: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
      completed: AtomicUsize::new(0),
      delay: Mutex::new(Duration::ZERO),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = delay;
  }

  pub fn respond(&self, method: Method, path: &str, status: u16, body: &str) {
    self.sticky.lock().unwrap().insert(
      route_key(method, path),
      Reply::Respond(NetResponse::new(status, body)),
    );
  }

  pub fn respond_once(&self, method: Method, path: &str, status: u16, body: &str) {
    self
      .once
      .lock()
      .unwrap()
      .entry(route_key(method, path))
      .or_default()
      .push_back(Reply::Respond(NetResponse::new(status, body)));
  }

  /// Make every call to this route fail at the transport level.
  pub fn fail(&self, method: Method, path: &str) {
    self
      .sticky
      .lock()
      .unwrap()
      .insert(route_key(method, path), Reply::Fail);
  }

  pub fn calls_to(&self, method: Method, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.method == method && r.path() == path)
      .count()
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  /// Calls that have finished (after any configured delay).
  pub fn completed(&self) -> usize {
    self.completed.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn request(&self, request: &Request) -> Result<NetResponse> {
    self.calls.lock().unwrap().push(request.clone());

    let delay = *self.delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    let result = if !self.online.load(Ordering::SeqCst) {
      Err(SyncError::NetworkUnavailable("offline".to_string()))
    } else {
      let key = route_key(request.method, request.path());
      let once = self
        .once
        .lock()
        .unwrap()
        .get_mut(&key)
        .and_then(|q| q.pop_front());
      let reply = once.or_else(|| self.sticky.lock().unwrap().get(&key).cloned());
      match reply {
        Some(Reply::Respond(response)) => Ok(response),
        Some(Reply::Fail) => Err(SyncError::NetworkUnavailable(format!(
          "connection refused: {}",
          key
        ))),
        None => Ok(NetResponse::new(404, "not found")),
      }
    };

    self.completed.fetch_add(1, Ordering::SeqCst);
    result
  }
}
