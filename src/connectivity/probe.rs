//! Reachability probe: turns TCP connect attempts into platform signals.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use super::{ConnectivityMonitor, LinkQuality, PlatformSignal};
use crate::error::{Result, SyncError};

/// Periodically checks whether the backend accepts connections.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
  addr: String,
  interval: Duration,
  timeout: Duration,
}

impl ReachabilityProbe {
  pub fn new(addr: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
    Self {
      addr: addr.into(),
      interval,
      timeout,
    }
  }

  /// Probe the host and port of a backend URL.
  pub fn for_url(base_url: &str, interval: Duration, timeout: Duration) -> Result<Self> {
    let url = Url::parse(base_url)
      .map_err(|e| SyncError::Config(format!("Invalid backend URL {}: {}", base_url, e)))?;
    let host = url
      .host_str()
      .ok_or_else(|| SyncError::Config(format!("Backend URL has no host: {}", base_url)))?;
    let port = url
      .port_or_known_default()
      .ok_or_else(|| SyncError::Config(format!("Backend URL has no port: {}", base_url)))?;
    Ok(Self::new(format!("{}:{}", host, port), interval, timeout))
  }

  /// One connection attempt. Returns the connect time on success.
  pub async fn probe_once(&self) -> Option<Duration> {
    let started = Instant::now();
    match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
      Ok(Ok(_stream)) => Some(started.elapsed()),
      Ok(Err(e)) => {
        debug!(addr = %self.addr, error = %e, "probe failed");
        None
      }
      Err(_) => {
        debug!(addr = %self.addr, "probe timed out");
        None
      }
    }
  }

  /// Probe forever, feeding results into the monitor. The monitor filters
  /// repeats, so every result is signalled.
  pub fn spawn(self, monitor: ConnectivityMonitor) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        match self.probe_once().await {
          Some(rtt) => {
            monitor.signal(PlatformSignal::QualityChanged(LinkQuality::from_rtt(rtt)));
            monitor.signal(PlatformSignal::Online);
          }
          None => {
            monitor.signal(PlatformSignal::Offline);
          }
        }
        tokio::time::sleep(self.interval).await;
      }
    })
  }
}
