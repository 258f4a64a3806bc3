//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

const DEFAULT_TARGET_ADDR: &str = "8.8.8.8:53";

/// Desktop network monitor implementation
///
/// Connectivity is a TCP connect to a target address, normally the upload
/// endpoint's host. Results are cached for `cache_ttl` so constraint checks
/// across a batch of jobs cost one connect.
///
/// Desktop connections are reported as unmetered; platform APIs that can
/// tell otherwise (NetworkManager, Windows cost hints) are not consulted.
#[derive(Clone)]
pub struct DesktopNetworkMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    target_addr: String,
    connect_timeout: Duration,
    cache_ttl: Duration,
    poll_interval: Duration,
    cached_info: Mutex<Option<(Instant, NetworkInfo)>>,
}

impl DesktopNetworkMonitor {
    /// Create a monitor probing a well-known public resolver
    pub fn new() -> Self {
        Self::with_target(DEFAULT_TARGET_ADDR)
    }

    /// Create a monitor probing `host:port`
    pub fn with_target(target_addr: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                target_addr: target_addr.into(),
                connect_timeout: Duration::from_secs(5),
                cache_ttl: Duration::from_secs(10),
                poll_interval: Duration::from_secs(5),
                cached_info: Mutex::new(None),
            }),
        }
    }

    /// Create a monitor probing the host and port of an endpoint URL
    pub fn for_endpoint(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| BridgeError::OperationFailed(format!("invalid endpoint url: {}", e)))?;
        // Host displays IPv6 literals in brackets
        let host = parsed
            .host()
            .ok_or_else(|| BridgeError::OperationFailed("endpoint url has no host".to_string()))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| BridgeError::OperationFailed("endpoint url has no port".to_string()))?;
        Ok(Self::with_target(format!("{}:{}", host, port)))
    }

    /// Override connect timing. Intended for tests and tight polling hosts.
    pub fn with_timing(
        self,
        connect_timeout: Duration,
        cache_ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                target_addr: self.inner.target_addr.clone(),
                connect_timeout,
                cache_ttl,
                poll_interval,
                cached_info: Mutex::new(None),
            }),
        }
    }

    pub fn target_addr(&self) -> &str {
        &self.inner.target_addr
    }

    async fn check_connectivity(&self) -> NetworkStatus {
        match tokio::time::timeout(
            self.inner.connect_timeout,
            tokio::net::TcpStream::connect(self.inner.target_addr.as_str()),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) => NetworkStatus::Disconnected,
            Err(_) => NetworkStatus::Disconnected,
        }
    }

    async fn check(&self) -> NetworkInfo {
        let status = self.check_connectivity().await;
        NetworkInfo {
            status,
            network_type: if status == NetworkStatus::Connected {
                Some(NetworkType::Other)
            } else {
                None
            },
            is_metered: false,
        }
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let mut cached = self.inner.cached_info.lock().await;
        if let Some((checked_at, info)) = cached.as_ref() {
            if checked_at.elapsed() < self.inner.cache_ttl {
                return Ok(info.clone());
            }
        }

        let info = self.check().await;
        *cached = Some((Instant::now(), info.clone()));
        debug!(status = ?info.status, target = %self.inner.target_addr, "Network info updated");

        Ok(info)
    }

    async fn is_metered(&self) -> bool {
        false
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(DesktopNetworkChangeStream {
            monitor: self.clone(),
            last_status: None,
        }))
    }
}

/// Network change stream that polls for changes
struct DesktopNetworkChangeStream {
    monitor: DesktopNetworkMonitor,
    last_status: Option<NetworkStatus>,
}

#[async_trait]
impl NetworkChangeStream for DesktopNetworkChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            let info = self.monitor.check().await;
            if self.last_status != Some(info.status) {
                self.last_status = Some(info.status);
                return Some(info);
            }
            tokio::time::sleep(self.monitor.inner.poll_interval).await;
        }
    }
}
