//! Connectivity gate polled before every network attempt.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Connectivity check.
///
/// Implementations must not cache the answer across calls.
#[async_trait]
pub trait Reachability: Send + Sync {
  async fn is_connected(&self) -> bool;
}

/// Reachability decided by a flag the host flips, e.g. from OS
/// connectivity notifications.
#[derive(Debug)]
pub struct StaticReachability {
  online: AtomicBool,
}

impl StaticReachability {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn online() -> Self {
    Self::new(true)
  }

  pub fn offline() -> Self {
    Self::new(false)
  }

  pub fn set(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

#[async_trait]
impl Reachability for StaticReachability {
  async fn is_connected(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

/// Probe that opens a TCP connection to a known endpoint.
///
/// Resolution and each connect attempt are bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
  target: String,
  timeout: Duration,
}

impl TcpProbe {
  /// `target` is a `host:port` pair.
  pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
    Self {
      target: target.into(),
      timeout,
    }
  }

  pub fn target(&self) -> &str {
    &self.target
  }

  async fn resolve(&self) -> Vec<SocketAddr> {
    match timeout(self.timeout, lookup_host(self.target.as_str())).await {
      Ok(Ok(addrs)) => addrs.collect(),
      Ok(Err(e)) => {
        debug!(probe = %self.target, error = %e, "reachability probe could not resolve");
        Vec::new()
      }
      Err(_) => {
        debug!(probe = %self.target, "reachability probe timed out resolving");
        Vec::new()
      }
    }
  }
}

#[async_trait]
impl Reachability for TcpProbe {
  async fn is_connected(&self) -> bool {
    let mut connected = false;
    for addr in self.resolve().await {
      if let Ok(Ok(_)) = timeout(self.timeout, TcpStream::connect(addr)).await {
        connected = true;
        break;
      }
    }
    debug!(probe = %self.target, connected, "reachability probe");
    connected
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_static_toggle() {
    let gate = StaticReachability::offline();
    assert!(!gate.is_connected().await);
    gate.set(true);
    assert!(gate.is_connected().await);
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_probe_shares_the_runtime_with_the_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let probe = TcpProbe::new(addr.to_string(), Duration::from_millis(500));

    // Both sides run as tasks on a single thread
    let (accepted, connected) = tokio::join!(listener.accept(), probe.is_connected());
    assert!(connected);
    assert!(accepted.is_ok());
  }

  #[tokio::test]
  async fn test_probe_unresolvable_is_offline() {
    let probe = TcpProbe::new("definitely-not-a-host.invalid:443", Duration::from_millis(500));
    assert!(!probe.is_connected().await);
  }

  #[tokio::test]
  async fn test_probe_closed_port_is_offline() {
    // Bind then drop to get a port nothing listens on
    let addr = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap()
    };

    let probe = TcpProbe::new(addr.to_string(), Duration::from_millis(200));
    assert!(!probe.is_connected().await);
  }
}
