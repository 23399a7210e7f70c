//! Update Checker and Update State Service.
//!
//! The checker compares local component versions against remote release
//! metadata. The state service is the single process-wide owner of the
//! resulting snapshot: it is replaced wholesale on each check and broadcast to
//! every subscriber, so independent panel surfaces (home, about) show the same
//! answer without re-querying the network.

pub mod version;

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use version::SemVer;

const CHECK_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Updatable components of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateComponent {
    /// The control panel itself.
    App,
    /// The PMHQ bridge.
    Bridge,
    /// The LLBot runtime.
    Runtime,
}

impl UpdateComponent {
    pub fn manifest_key(&self) -> &'static str {
        match self {
            UpdateComponent::App => "panel",
            UpdateComponent::Bridge => "pmhq",
            UpdateComponent::Runtime => "llbot",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            UpdateComponent::App => "Control Panel",
            UpdateComponent::Bridge => "PMHQ",
            UpdateComponent::Runtime => "LLBot",
        }
    }
}

/// Result of one component's check.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateCheck {
    pub has_update: bool,
    pub latest_version: String,
    pub release_url: String,
}

/// Remote release metadata, one document per component.
#[derive(Debug, Clone, Deserialize)]
struct ReleaseInfo {
    version: String,
    #[serde(default)]
    url: String,
}

pub struct UpdateChecker {
    http: reqwest::Client,
    /// Release metadata base URL. Overridable for tests against a local mock.
    base_url: String,
}

impl UpdateChecker {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("llpanel-core/0.1")
            .timeout(Duration::from_secs(15))
            .build()
            .expect("HTTP client for update checks");

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Check one component. A local version that is empty or unparsable never
    /// reports an update: an unconfigured component must not nag the user.
    pub async fn check(
        &self,
        component: UpdateComponent,
        local_version: &str,
    ) -> anyhow::Result<UpdateCheck> {
        let local = match SemVer::parse(local_version) {
            Some(v) => v,
            None => {
                tracing::debug!(
                    "Local version for {} is '{}', skipping check",
                    component.display_name(),
                    local_version
                );
                return Ok(UpdateCheck::default());
            }
        };

        let release = self.fetch_release(component).await?;
        let latest = match SemVer::parse(&release.version) {
            Some(v) => v,
            None => {
                tracing::warn!(
                    "Remote version for {} is unparsable: '{}'",
                    component.display_name(),
                    release.version
                );
                return Ok(UpdateCheck::default());
            }
        };

        Ok(UpdateCheck {
            has_update: latest.is_newer_than(&local),
            latest_version: release.version,
            release_url: release.url,
        })
    }

    pub async fn check_app_update(&self, local: &str) -> anyhow::Result<UpdateCheck> {
        self.check(UpdateComponent::App, local).await
    }

    pub async fn check_bridge_update(&self, local: &str) -> anyhow::Result<UpdateCheck> {
        self.check(UpdateComponent::Bridge, local).await
    }

    pub async fn check_runtime_update(&self, local: &str) -> anyhow::Result<UpdateCheck> {
        self.check(UpdateComponent::Runtime, local).await
    }

    /// Fetch release metadata with a couple of fixed-backoff retries for
    /// transient network faults.
    async fn fetch_release(&self, component: UpdateComponent) -> anyhow::Result<ReleaseInfo> {
        let url = format!("{}/{}/latest.json", self.base_url, component.manifest_key());

        let mut attempt = 0;
        loop {
            match self.fetch_release_once(&url).await {
                Ok(release) => return Ok(release),
                Err(e) if attempt < CHECK_RETRIES => {
                    attempt += 1;
                    tracing::debug!("Release fetch retry {} for {}: {}", attempt, url, e);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_release_once(&self, url: &str) -> anyhow::Result<ReleaseInfo> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("release metadata fetch failed: {}", response.status());
        }
        Ok(response.json::<ReleaseInfo>().await?)
    }
}

// ── Update State Service ─────────────────────────────────────

/// Snapshot of the last check cycle, replaced wholesale on every publish.
/// Readers receive it by value and must not assume later mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateState {
    /// Whether at least one check cycle has completed this session.
    pub checked: bool,
    /// Per-component results, keyed by manifest key.
    pub components: HashMap<String, UpdateCheck>,
}

impl UpdateState {
    pub fn component(&self, component: UpdateComponent) -> Option<&UpdateCheck> {
        self.components.get(component.manifest_key())
    }

    pub fn any_update(&self) -> bool {
        self.components.values().any(|c| c.has_update)
    }
}

/// Single-writer owner of the shared snapshot. Injected into every consumer;
/// there is deliberately no global instance.
pub struct UpdateStateService {
    state: RwLock<UpdateState>,
    tx: broadcast::Sender<UpdateState>,
}

impl Default for UpdateStateService {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateStateService {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            state: RwLock::new(UpdateState::default()),
            tx,
        }
    }

    pub fn current(&self) -> UpdateState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateState> {
        self.tx.subscribe()
    }

    /// Replace the snapshot and broadcast it to every active subscriber.
    pub fn publish(&self, mut state: UpdateState) {
        state.checked = true;
        if let Ok(mut slot) = self.state.write() {
            *slot = state.clone();
        }
        let _ = self.tx.send(state);
    }

    /// Drop the update flag for one component after a successful install and
    /// republish, so every surface stops advertising it.
    pub fn clear_update(&self, component: UpdateComponent) {
        let mut state = self.current();
        if let Some(check) = state.components.get_mut(component.manifest_key()) {
            check.has_update = false;
        }
        if let Ok(mut slot) = self.state.write() {
            *slot = state.clone();
        }
        let _ = self.tx.send(state);
    }

    /// Run one full check cycle and publish exactly one snapshot.
    pub async fn run_check(
        &self,
        checker: &UpdateChecker,
        local_versions: &[(UpdateComponent, String)],
    ) {
        let mut state = UpdateState::default();
        for (component, local) in local_versions {
            match checker.check(*component, local).await {
                Ok(check) => {
                    state
                        .components
                        .insert(component.manifest_key().to_string(), check);
                }
                Err(e) => {
                    tracing::warn!("Update check failed for {}: {}", component.display_name(), e);
                    state
                        .components
                        .insert(component.manifest_key().to_string(), UpdateCheck::default());
                }
            }
        }
        self.publish(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_local_version_never_reports_update() {
        // base URL is never contacted: the gate short-circuits first
        let checker = UpdateChecker::new("http://127.0.0.1:1");
        for local in ["", "unknown", "not-a-version"] {
            let check = checker.check(UpdateComponent::Bridge, local).await.unwrap();
            assert!(!check.has_update, "'{}' must not report an update", local);
        }
    }

    #[test]
    fn snapshot_replaced_wholesale() {
        let service = UpdateStateService::new();
        assert!(!service.current().checked);

        let mut state = UpdateState::default();
        state.components.insert(
            "pmhq".into(),
            UpdateCheck {
                has_update: true,
                latest_version: "2.0.0".into(),
                release_url: "https://example.com/pmhq".into(),
            },
        );
        service.publish(state);

        let current = service.current();
        assert!(current.checked);
        assert!(current.any_update());
        assert_eq!(
            current.component(UpdateComponent::Bridge).unwrap().latest_version,
            "2.0.0"
        );
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_same_snapshot() {
        let service = UpdateStateService::new();
        let mut rx_a = service.subscribe();
        let mut rx_b = service.subscribe();

        let mut state = UpdateState::default();
        state
            .components
            .insert("llbot".into(), UpdateCheck::default());
        service.publish(state);

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(a, b);
        assert!(a.checked);
    }

    #[tokio::test]
    async fn clear_update_republishes() {
        let service = UpdateStateService::new();
        let mut state = UpdateState::default();
        state.components.insert(
            "panel".into(),
            UpdateCheck {
                has_update: true,
                latest_version: "1.1.0".into(),
                release_url: String::new(),
            },
        );
        service.publish(state);

        let mut rx = service.subscribe();
        service.clear_update(UpdateComponent::App);

        let snapshot = rx.recv().await.unwrap();
        assert!(!snapshot.component(UpdateComponent::App).unwrap().has_update);
        assert!(!service.current().any_update());
    }
}
