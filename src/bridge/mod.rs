//! Bridge API Client.
//!
//! Talks to the local HTTP API the PMHQ bridge exposes once it is up. The
//! bridge binds a dynamic port, so every call is scoped to the port most
//! recently recorded with [`BridgeApiClient::set_port`]. During startup the
//! endpoints refuse connections for a while; polling treats that as an
//! expected transient, not an error.

pub mod sse;

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Identity poll cadence: one request per second until the uin shows up.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("bridge port not set")]
    PortNotSet,
    #[error("request failed: {0}")]
    Request(String),
}

/// Identity of the logged-in account. An empty uin means "not logged in yet".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SelfInfo {
    #[serde(default)]
    pub uin: String,
    #[serde(default)]
    pub nick: String,
}

/// Build metadata of the messaging client, served by the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub platform: String,
}

pub struct BridgeApiClient {
    http: reqwest::Client,
    port: Mutex<Option<u16>>,
    /// Device info never changes within a session, so the first successful
    /// fetch is cached and later calls return it without touching the network.
    device_info: tokio::sync::Mutex<Option<DeviceInfo>>,
    /// Root token for `cancel_all`. Every poll loop holds a child of it.
    cancel_root: Mutex<CancellationToken>,
}

impl Default for BridgeApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeApiClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .user_agent("llpanel-core/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("HTTP client for bridge API");

        Self {
            http,
            port: Mutex::new(None),
            device_info: tokio::sync::Mutex::new(None),
            cancel_root: Mutex::new(CancellationToken::new()),
        }
    }

    /// Record the bridge's dynamic port. Subsequent calls target it.
    pub fn set_port(&self, port: u16) {
        if let Ok(mut slot) = self.port.lock() {
            *slot = Some(port);
        }
    }

    /// Forget the port; later calls fail fast with [`BridgeError::PortNotSet`].
    pub fn clear_port(&self) {
        if let Ok(mut slot) = self.port.lock() {
            *slot = None;
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.port.lock().map(|p| *p).unwrap_or(None)
    }

    fn base_url(&self) -> Result<String, BridgeError> {
        self.port()
            .map(|p| format!("http://127.0.0.1:{}", p))
            .ok_or(BridgeError::PortNotSet)
    }

    /// Cancel every outstanding poll loop. Safe when nothing is outstanding,
    /// and safe to call repeatedly.
    pub fn cancel_all(&self) {
        if let Ok(mut root) = self.cancel_root.lock() {
            root.cancel();
            *root = CancellationToken::new();
        }
    }

    /// Snapshot of the current `cancel_all` generation. Poll loops select on
    /// this alongside the caller's token; no forwarding task is needed.
    fn session_token(&self) -> CancellationToken {
        self.cancel_root
            .lock()
            .map(|root| root.child_token())
            .unwrap_or_default()
    }

    /// Poll the identity endpoint until it answers with a non-empty uin or the
    /// token is cancelled. Connection refused during bridge startup is an
    /// expected transient and retried silently; `None` only means cancelled
    /// or no port configured.
    pub async fn fetch_self_info(&self, cancel: &CancellationToken) -> Option<SelfInfo> {
        let session = self.session_token();
        loop {
            if cancel.is_cancelled() || session.is_cancelled() {
                return None;
            }
            let base = match self.base_url() {
                Ok(base) => base,
                Err(_) => return None,
            };

            match self.get_json::<SelfInfo>(&format!("{}/api/self_info", base)).await {
                Ok(info) if !info.uin.is_empty() => return Some(info),
                Ok(_) => {} // bridge up, account not logged in yet
                Err(e) => tracing::trace!("Self-info poll: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = session.cancelled() => return None,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Poll the device-info endpoint until it answers or the token is
    /// cancelled. The first success is cached for the rest of the session.
    pub async fn fetch_device_info(&self, cancel: &CancellationToken) -> Option<DeviceInfo> {
        {
            let cached = self.device_info.lock().await;
            if let Some(info) = cached.as_ref() {
                return Some(info.clone());
            }
        }

        let session = self.session_token();
        loop {
            if cancel.is_cancelled() || session.is_cancelled() {
                return None;
            }
            let base = match self.base_url() {
                Ok(base) => base,
                Err(_) => return None,
            };

            match self.get_json::<DeviceInfo>(&format!("{}/api/device_info", base)).await {
                Ok(info) => {
                    let mut cached = self.device_info.lock().await;
                    *cached = Some(info.clone());
                    return Some(info);
                }
                Err(e) => tracing::trace!("Device-info poll: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = session.cancelled() => return None,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, BridgeError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BridgeError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BridgeError::Request(format!("status {}", response.status())));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BridgeError::Request(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_port_means_no_base_url() {
        let client = BridgeApiClient::new();
        assert!(matches!(client.base_url(), Err(BridgeError::PortNotSet)));

        client.set_port(13000);
        assert_eq!(client.base_url().unwrap(), "http://127.0.0.1:13000");

        client.clear_port();
        assert!(matches!(client.base_url(), Err(BridgeError::PortNotSet)));
    }

    #[tokio::test]
    async fn fetch_without_port_fails_fast() {
        let client = BridgeApiClient::new();
        let token = CancellationToken::new();
        assert!(client.fetch_self_info(&token).await.is_none());
        assert!(client.fetch_device_info(&token).await.is_none());
    }

    #[tokio::test]
    async fn cancel_all_stops_outstanding_poll() {
        let client = std::sync::Arc::new(BridgeApiClient::new());
        // unroutable port: connection refused keeps the loop polling
        client.set_port(1);

        let poller = client.clone();
        let token = CancellationToken::new();
        let handle = tokio::spawn(async move { poller.fetch_self_info(&token).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.cancel_all();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poll loop stops after cancel_all")
            .unwrap();
        assert!(result.is_none());

        // idempotent when nothing is outstanding
        client.cancel_all();
        client.cancel_all();
    }

    #[tokio::test]
    async fn poll_started_after_cancel_all_uses_a_fresh_session() {
        let client = std::sync::Arc::new(BridgeApiClient::new());
        client.set_port(1);
        // an old generation must not pre-cancel later polls
        client.cancel_all();

        let poller = client.clone();
        let token = CancellationToken::new();
        let handle = tokio::spawn(async move { poller.fetch_self_info(&token).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.cancel_all();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("fresh poll loop stops on the current generation")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn caller_cancellation_returns_none() {
        let client = BridgeApiClient::new();
        client.set_port(1);
        let token = CancellationToken::new();
        token.cancel();
        assert!(client.fetch_self_info(&token).await.is_none());
    }
}
