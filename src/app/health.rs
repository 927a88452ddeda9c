use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::cache::unix_now;
use crate::app::manager::ServerManager;
use crate::app::probe::ProbeEngine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded(_) => "degraded",
            HealthStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Unix seconds.
    pub checked_at: u64,
    pub latency_ms: Option<u64>,
}

/// 周期性检查：配置文件可解析、指向当前服务器、当前服务器 TCP 可达
pub struct HealthChecker {
    manager: Arc<ServerManager>,
    probe: ProbeEngine,
    interval: Duration,
    last: RwLock<Option<HealthReport>>,
}

impl HealthChecker {
    pub fn new(manager: Arc<ServerManager>, probe: ProbeEngine, interval: Duration) -> Self {
        Self {
            manager,
            probe,
            interval,
            last: RwLock::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn last(&self) -> Option<HealthReport> {
        self.last.read().await.clone()
    }

    /// Run one check and remember the result.
    pub async fn check(&self) -> HealthReport {
        let (status, latency_ms) = self.evaluate().await;
        let report = HealthReport {
            status,
            checked_at: unix_now(),
            latency_ms,
        };

        match &report.status {
            HealthStatus::Healthy => debug!(latency_ms = ?report.latency_ms, "health check ok"),
            HealthStatus::Degraded(reason) => {
                warn!(reason = %reason, "health check degraded");
                // 自动重启未启用：只记录，不动代理
                debug!("auto-restart disabled, proxy left as is");
            }
            HealthStatus::Unknown => debug!("health check: no active server"),
        }

        *self.last.write().await = Some(report.clone());
        report
    }

    async fn evaluate(&self) -> (HealthStatus, Option<u64>) {
        let Some(active) = self.manager.active_server().await else {
            return (HealthStatus::Unknown, None);
        };
        let identity = match self.manager.writer().current_endpoint() {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                return (
                    HealthStatus::Degraded("proxy config has no proxy outbound".into()),
                    None,
                )
            }
            Err(e) => return (HealthStatus::Degraded(e.to_string()), None),
        };

        if !identity.matches(&active) {
            return (
                HealthStatus::Degraded(format!(
                    "proxy config points at {}:{}, expected {}",
                    identity.address,
                    identity.port,
                    active.endpoint()
                )),
                None,
            );
        }

        let result = self.probe.probe_one(&active).await;
        if result.available {
            (HealthStatus::Healthy, result.latency_ms)
        } else {
            let kind = result.error.map(|k| k.as_str()).unwrap_or("unreachable");
            (
                HealthStatus::Degraded(format!("{} is unreachable ({})", active.name, kind)),
                None,
            )
        }
    }

    /// Tick every `interval` until cancelled. The first check runs after one interval.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(interval_secs = this.interval.as_secs(), "health checker started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = this.check() => {}
                        }
                    }
                }
            }
            debug!("health checker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::cache::SubscriptionCache;
    use crate::app::fetcher::SubscriptionSource;
    use crate::app::restart::ProxyRestarter;
    use crate::common::error::AgentError;
    use crate::config::xray::XrayConfigWriter;
    use async_trait::async_trait;
    use base64::Engine;
    use tokio::net::TcpListener;

    struct StaticSource(String);

    #[async_trait]
    impl SubscriptionSource for StaticSource {
        async fn fetch(&self, _url: &str, _cancel: &CancellationToken) -> Result<String, AgentError> {
            Ok(self.0.clone())
        }
    }

    struct NoopRestart;

    #[async_trait]
    impl ProxyRestarter for NoopRestart {
        async fn restart(&self) -> Result<(), AgentError> {
            Ok(())
        }
    }

    async fn setup(port: u16) -> (tempfile::TempDir, Arc<ServerManager>) {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(
            &config,
            r#"{"outbounds":[{"tag":"proxy","protocol":"vless","settings":{}}]}"#,
        )
        .unwrap();
        let uri = format!(
            "vless://ec82bca8-1072-4682-822f-30306af408ea@127.0.0.1:{}#local",
            port
        );
        let body = base64::engine::general_purpose::STANDARD.encode(uri);
        let manager = Arc::new(ServerManager::new(
            "https://sub.example.com/s",
            Arc::new(StaticSource(body)),
            SubscriptionCache::new(dir.path().join("cache"), Duration::from_secs(60)),
            XrayConfigWriter::new(&config),
            Arc::new(NoopRestart),
        ));
        manager.load_servers(&CancellationToken::new()).await.unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn unknown_without_active_server() {
        let (_dir, manager) = setup(1).await;
        let checker = HealthChecker::new(manager, ProbeEngine::new(Duration::from_secs(1)), Duration::from_secs(60));
        assert_eq!(checker.check().await.status, HealthStatus::Unknown);
        assert!(checker.last().await.is_some());
    }

    #[tokio::test]
    async fn healthy_when_active_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_dir, manager) = setup(port).await;
        let id = manager.servers().await[0].id.clone();
        manager.switch(&id).await.unwrap();

        let checker = HealthChecker::new(manager, ProbeEngine::new(Duration::from_secs(2)), Duration::from_secs(60));
        let report = checker.check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.latency_ms.is_some());
    }

    #[tokio::test]
    async fn degraded_when_config_drifts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (dir, manager) = setup(port).await;
        let id = manager.servers().await[0].id.clone();
        manager.switch(&id).await.unwrap();

        std::fs::write(
            dir.path().join("config.json"),
            r#"{"outbounds":[{"tag":"proxy","protocol":"vless","settings":{"vnext":[{"address":"10.0.0.1","port":443}]}}]}"#,
        )
        .unwrap();
        let checker = HealthChecker::new(manager, ProbeEngine::new(Duration::from_secs(1)), Duration::from_secs(60));
        assert!(matches!(checker.check().await.status, HealthStatus::Degraded(_)));
    }

    #[tokio::test]
    async fn spawn_stops_on_cancel() {
        let (_dir, manager) = setup(1).await;
        let checker = Arc::new(HealthChecker::new(
            manager,
            ProbeEngine::new(Duration::from_secs(1)),
            Duration::from_millis(20),
        ));
        let cancel = CancellationToken::new();
        let handle = checker.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(checker.last().await.is_some());
    }
}
