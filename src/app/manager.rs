//! Server set ownership and the switch protocol.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::cache::{unix_now, SubscriptionCache};
use crate::app::fetcher::SubscriptionSource;
use crate::app::restart::ProxyRestarter;
use crate::common::error::AgentError;
use crate::config::subscription::{servers_from_body, Server};
use crate::config::xray::XrayConfigWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    Network,
    /// Fetch failed; an expired cache entry was served instead.
    StaleCache,
}

impl LoadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadSource::Cache => "cache",
            LoadSource::Network => "network",
            LoadSource::StaleCache => "stale-cache",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub count: usize,
    pub source: LoadSource,
    pub fetched_at: u64,
}

#[derive(Debug, Clone, Default)]
struct ServerState {
    servers: Vec<Server>,
    active: Option<String>,
    fetched_at: Option<u64>,
}

/// Read-only copy of the manager state.
#[derive(Debug, Clone, Default)]
pub struct ServerSnapshot {
    pub servers: Vec<Server>,
    pub active: Option<String>,
    pub fetched_at: Option<u64>,
}

impl ServerSnapshot {
    pub fn active_server(&self) -> Option<&Server> {
        let id = self.active.as_deref()?;
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn find(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }
}

/// Owns the current [`Server`] set and the active selection.
///
/// `op_lock` serialises load, switch and detect. A switch never waits for it:
/// when it is taken the switch returns [`AgentError::SwitchInProgress`].
pub struct ServerManager {
    url: String,
    source: Arc<dyn SubscriptionSource>,
    cache: SubscriptionCache,
    writer: XrayConfigWriter,
    restarter: Arc<dyn ProxyRestarter>,
    op_lock: Mutex<()>,
    state: RwLock<ServerState>,
}

impl ServerManager {
    pub fn new(
        url: impl Into<String>,
        source: Arc<dyn SubscriptionSource>,
        cache: SubscriptionCache,
        writer: XrayConfigWriter,
        restarter: Arc<dyn ProxyRestarter>,
    ) -> Self {
        Self {
            url: url.into(),
            source,
            cache,
            writer,
            restarter,
            op_lock: Mutex::new(()),
            state: RwLock::new(ServerState::default()),
        }
    }

    pub fn cache(&self) -> &SubscriptionCache {
        &self.cache
    }

    pub fn writer(&self) -> &XrayConfigWriter {
        &self.writer
    }

    /// Load the server set: fresh cache entry, else network, else stale cache.
    pub async fn load_servers(&self, cancel: &CancellationToken) -> Result<LoadOutcome, AgentError> {
        let _guard = self.op_lock.lock().await;

        if let Some(entry) = self.cache.get(&self.url) {
            let outcome = LoadOutcome {
                count: entry.servers.len(),
                source: LoadSource::Cache,
                fetched_at: entry.fetched_at,
            };
            self.replace_servers(entry.servers, entry.fetched_at).await;
            return Ok(outcome);
        }

        match self.fetch_and_store(cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(AgentError::FetchFailed(reason)) => {
                let Some(stale) = self.cache.get_stale(&self.url) else {
                    return Err(AgentError::FetchFailed(reason));
                };
                warn!(
                    reason = %reason,
                    age_secs = stale.age_at(unix_now()).as_secs(),
                    "subscription fetch failed, serving stale cache"
                );
                let outcome = LoadOutcome {
                    count: stale.servers.len(),
                    source: LoadSource::StaleCache,
                    fetched_at: stale.fetched_at,
                };
                self.replace_servers(stale.servers, stale.fetched_at).await;
                Ok(outcome)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the cache entry and fetch again. No stale fallback.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<LoadOutcome, AgentError> {
        let _guard = self.op_lock.lock().await;
        if let Err(e) = self.cache.invalidate(&self.url) {
            warn!(error = %e, "cannot invalidate subscription cache");
        }
        self.fetch_and_store(cancel).await
    }

    /// Caller holds `op_lock`.
    async fn fetch_and_store(&self, cancel: &CancellationToken) -> Result<LoadOutcome, AgentError> {
        let body = self.source.fetch(&self.url, cancel).await?;
        let (decoded, servers) = servers_from_body(&body)?;

        let fetched_at = match self.cache.put(&self.url, &decoded, &servers) {
            Ok(entry) => entry.fetched_at,
            Err(e) => {
                warn!(error = %e, "cannot write subscription cache");
                unix_now()
            }
        };
        let outcome = LoadOutcome {
            count: servers.len(),
            source: LoadSource::Network,
            fetched_at,
        };
        info!(servers = servers.len(), "subscription loaded from network");
        self.replace_servers(servers, fetched_at).await;
        Ok(outcome)
    }

    /// Caller holds `op_lock`.
    async fn replace_servers(&self, servers: Vec<Server>, fetched_at: u64) {
        let previous_active = self.state.read().await.active.clone();
        let still_present = previous_active
            .as_deref()
            .is_some_and(|id| servers.iter().any(|s| s.id == id));

        let active = if still_present {
            previous_active
        } else {
            self.match_config(&servers)
        };

        let mut state = self.state.write().await;
        state.servers = servers;
        state.active = active;
        state.fetched_at = Some(fetched_at);
    }

    fn match_config(&self, servers: &[Server]) -> Option<String> {
        let identity = match self.writer.current_endpoint() {
            Ok(Some(identity)) => identity,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "cannot read proxy config for detection");
                return None;
            }
        };
        let mut candidates = servers.iter().filter(|s| identity.matches(s));
        let first = candidates.next()?;
        // 同一 address:port 下多个凭据时用 uuid 消歧
        let exact = std::iter::once(first)
            .chain(candidates)
            .find(|s| identity.uuid.as_deref() == Some(s.uuid.as_str()));
        Some(exact.unwrap_or(first).id.clone())
    }

    /// Re-derive the active selection from the proxy config file.
    pub async fn detect_current(&self) -> Option<Server> {
        let _guard = self.op_lock.lock().await;
        let servers = self.state.read().await.servers.clone();
        let detected = self.match_config(&servers);
        let mut state = self.state.write().await;
        state.active = detected.clone();
        let server = detected.and_then(|id| servers.into_iter().find(|s| s.id == id));
        match &server {
            Some(s) => debug!(server = %s.id, name = %s.name, "active server detected"),
            None => debug!("proxy config does not match any known server"),
        }
        server
    }

    /// Point the proxy at `target_id`.
    ///
    /// Writes the config, restarts the proxy and rolls the file back when the
    /// restart fails. The active selection changes only on full success.
    pub async fn switch(&self, target_id: &str) -> Result<Server, AgentError> {
        let _guard = self
            .op_lock
            .try_lock()
            .map_err(|_| AgentError::SwitchInProgress)?;

        let (target, active) = {
            let state = self.state.read().await;
            let target = state
                .servers
                .iter()
                .find(|s| s.id == target_id)
                .cloned()
                .ok_or_else(|| AgentError::ServerNotFound(target_id.to_string()))?;
            (target, state.active.clone())
        };
        if active.as_deref() == Some(target_id) {
            return Err(AgentError::AlreadyActive(target.name.clone()));
        }

        let snapshot = self.writer.read_raw()?;
        self.writer.apply(&target)?;

        if let Err(restart_err) = self.restarter.restart().await {
            let restart = restart_err.to_string();
            warn!(server = %target.id, error = %restart, "restart failed, rolling back proxy config");
            if let Err(rollback_err) = self.writer.restore(&snapshot) {
                error!(
                    restart = %restart,
                    rollback = %rollback_err,
                    "proxy config rollback failed"
                );
                return Err(AgentError::RestartFailedRollbackFailed {
                    restart,
                    rollback: rollback_err.to_string(),
                });
            }
            return Err(match restart_err {
                AgentError::RestartFailed(msg) => AgentError::RestartFailed(msg),
                other => AgentError::RestartFailed(other.to_string()),
            });
        }

        self.state.write().await.active = Some(target.id.clone());
        info!(server = %target.id, name = %target.name, endpoint = %target.endpoint(), "switched");
        Ok(target)
    }

    pub async fn snapshot(&self) -> ServerSnapshot {
        let state = self.state.read().await;
        ServerSnapshot {
            servers: state.servers.clone(),
            active: state.active.clone(),
            fetched_at: state.fetched_at,
        }
    }

    pub async fn servers(&self) -> Vec<Server> {
        self.state.read().await.servers.clone()
    }

    pub async fn active_server(&self) -> Option<Server> {
        let state = self.state.read().await;
        let id = state.active.as_deref()?;
        state.servers.iter().find(|s| s.id == id).cloned()
    }

    pub async fn server(&self, id: &str) -> Option<Server> {
        self.state
            .read()
            .await
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn servers_count(&self) -> usize {
        self.state.read().await.servers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::Engine;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const URI_A: &str = "vless://ec82bca8-1072-4682-822f-30306af408ea@1.2.3.4:443?type=tcp&security=reality&sni=example.com&pbk=k&sid=s&fp=chrome#Test%20Server";
    const URI_B: &str = "vless://0b5e7c1e-3f57-4f0e-9f3a-2a8f8a0d1c11@5.6.7.8:8443?security=tls#Second";

    struct FakeSource {
        body: std::sync::Mutex<Result<String, String>>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(lines: &[&str]) -> Arc<Self> {
            let body = base64::engine::general_purpose::STANDARD.encode(lines.join("\n"));
            Arc::new(Self {
                body: std::sync::Mutex::new(Ok(body)),
                calls: AtomicUsize::new(0),
            })
        }

        fn fail(&self) {
            *self.body.lock().unwrap() = Err("connection refused".into());
        }
    }

    #[async_trait]
    impl SubscriptionSource for FakeSource {
        async fn fetch(&self, _url: &str, _cancel: &CancellationToken) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.body.lock().unwrap().clone().map_err(AgentError::FetchFailed)
        }
    }

    #[derive(Default)]
    struct FakeRestarter {
        fail: AtomicBool,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ProxyRestarter for FakeRestarter {
        async fn restart(&self) -> Result<(), AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(AgentError::RestartFailed("exit code 1".into()))
            } else {
                Ok(())
            }
        }
    }

    const CONFIG: &str = r#"{
  "outbounds": [
    { "tag": "proxy", "protocol": "vless", "settings": { "vnext": [ { "address": "9.9.9.9", "port": 1, "users": [ { "id": "x" } ] } ] } },
    { "tag": "direct", "protocol": "freedom" }
  ]
}"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: std::path::PathBuf,
        source: Arc<FakeSource>,
        restarter: Arc<FakeRestarter>,
        manager: ServerManager,
    }

    fn fixture(lines: &[&str], ttl: u64, restarter: FakeRestarter) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("04_outbounds.json");
        std::fs::write(&config, CONFIG).unwrap();
        let source = FakeSource::new(lines);
        let restarter = Arc::new(restarter);
        let manager = ServerManager::new(
            "https://sub.example.com/s",
            source.clone(),
            SubscriptionCache::new(dir.path().join("cache"), Duration::from_secs(ttl)),
            XrayConfigWriter::new(&config),
            restarter.clone(),
        );
        Fixture {
            _dir: dir,
            config,
            source,
            restarter,
            manager,
        }
    }

    #[tokio::test]
    async fn load_then_switch() {
        let f = fixture(&[URI_A], 3600, FakeRestarter::default());
        let outcome = f.manager.load_servers(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.source, LoadSource::Network);

        let snap = f.manager.snapshot().await;
        assert_eq!(snap.servers[0].name, "Test Server");
        assert!(snap.active.is_none());

        let id = snap.servers[0].id.clone();
        let switched = f.manager.switch(&id).await.unwrap();
        assert_eq!(switched.address, "1.2.3.4");
        assert_eq!(f.restarter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.manager.active_server().await.unwrap().id, id);

        // detect agrees with the file
        assert_eq!(f.manager.detect_current().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn second_switch_is_already_active() {
        let f = fixture(&[URI_A], 3600, FakeRestarter::default());
        f.manager.load_servers(&CancellationToken::new()).await.unwrap();
        let id = f.manager.servers().await[0].id.clone();
        f.manager.switch(&id).await.unwrap();
        let before = std::fs::read(&f.config).unwrap();

        let err = f.manager.switch(&id).await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyActive(_)));
        assert_eq!(std::fs::read(&f.config).unwrap(), before);
        assert_eq!(f.restarter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_failure_rolls_back() {
        let restarter = FakeRestarter::default();
        restarter.fail.store(true, Ordering::SeqCst);
        let f = fixture(&[URI_A], 3600, restarter);
        f.manager.load_servers(&CancellationToken::new()).await.unwrap();
        let id = f.manager.servers().await[0].id.clone();

        let err = f.manager.switch(&id).await.unwrap_err();
        assert!(matches!(err, AgentError::RestartFailed(_)));
        assert_eq!(std::fs::read_to_string(&f.config).unwrap(), CONFIG);
        assert!(f.manager.active_server().await.is_none());
    }

    #[tokio::test]
    async fn unknown_server() {
        let f = fixture(&[URI_A], 3600, FakeRestarter::default());
        f.manager.load_servers(&CancellationToken::new()).await.unwrap();
        let err = f.manager.switch("deadbeef0000").await.unwrap_err();
        assert!(matches!(err, AgentError::ServerNotFound(_)));
        assert_eq!(f.restarter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_switch_reports_in_progress() {
        let restarter = FakeRestarter {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let f = fixture(&[URI_A, URI_B], 3600, restarter);
        f.manager.load_servers(&CancellationToken::new()).await.unwrap();
        let servers = f.manager.servers().await;

        let (first, second) = tokio::join!(f.manager.switch(&servers[0].id), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.manager.switch(&servers[1].id).await
        });
        assert!(first.is_ok());
        assert!(matches!(second, Err(AgentError::SwitchInProgress)));
    }

    #[tokio::test]
    async fn cache_hit_skips_fetch() {
        let f = fixture(&[URI_A], 3600, FakeRestarter::default());
        let cancel = CancellationToken::new();
        f.manager.load_servers(&cancel).await.unwrap();
        let outcome = f.manager.load_servers(&cancel).await.unwrap();
        assert_eq!(outcome.source, LoadSource::Cache);
        assert_eq!(f.source.calls.load(Ordering::SeqCst), 1);

        f.manager.refresh(&cancel).await.unwrap();
        assert_eq!(f.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_cache_served_when_fetch_fails() {
        let f = fixture(&[URI_A], 3600, FakeRestarter::default());
        let cancel = CancellationToken::new();
        f.manager.load_servers(&cancel).await.unwrap();

        // age the entry past its TTL
        let entry = f.manager.cache().get_stale("https://sub.example.com/s").unwrap();
        f.manager
            .cache()
            .put_at(&entry.url, &entry.raw, &entry.servers, 1)
            .unwrap();
        f.source.fail();

        let outcome = f.manager.load_servers(&cancel).await.unwrap();
        assert_eq!(outcome.source, LoadSource::StaleCache);
        assert_eq!(outcome.count, 1);

        // explicit refresh never falls back
        let err = f.manager.refresh(&cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::FetchFailed(_)));
    }

    #[tokio::test]
    async fn empty_subscription_is_no_servers_and_not_cached() {
        let f = fixture(&["garbage", ""], 3600, FakeRestarter::default());
        let err = f.manager.load_servers(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::NoServers));
        assert!(f.manager.cache().get_stale("https://sub.example.com/s").is_none());
    }

    #[tokio::test]
    async fn active_recovered_from_config_on_load() {
        let f = fixture(&[URI_A, URI_B], 3600, FakeRestarter::default());
        f.manager.load_servers(&CancellationToken::new()).await.unwrap();
        let b = f.manager.servers().await[1].clone();
        f.manager.switch(&b.id).await.unwrap();

        // a fresh manager over the same files finds B active
        let other = ServerManager::new(
            "https://sub.example.com/s",
            f.source.clone(),
            f.manager.cache().clone(),
            XrayConfigWriter::new(&f.config),
            f.restarter.clone(),
        );
        other.load_servers(&CancellationToken::new()).await.unwrap();
        assert_eq!(other.active_server().await.unwrap().id, b.id);
    }
}
