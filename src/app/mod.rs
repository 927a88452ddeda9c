pub mod cache;
pub mod fetcher;
pub mod health;
pub mod manager;
pub mod name_optimizer;
pub mod probe;
pub mod restart;
pub mod security;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bot::{ChatTransport, CommandRouter, RouterDeps, SessionManager, TelegramTransport};
use crate::common::error::AgentError;
use crate::config::types::Settings;
use crate::config::xray::XrayConfigWriter;

use cache::SubscriptionCache;
use fetcher::{HttpFetcher, SubscriptionSource};
use health::HealthChecker;
use manager::{LoadOutcome, ServerManager};
use probe::ProbeEngine;
use restart::{CommandInvoker, CommandSpec, ProxyRestarter};

pub const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// External collaborators the supervisor wires together.
pub struct AppParts {
    pub transport: Arc<dyn ChatTransport>,
    pub source: Arc<dyn SubscriptionSource>,
    pub restarter: Arc<dyn ProxyRestarter>,
    pub cache_dir: PathBuf,
}

/// Cloneable control handle: stop, reload, fatal reports.
#[derive(Clone)]
pub struct AppHandle {
    cancel: CancellationToken,
    reload_tx: mpsc::UnboundedSender<()>,
    fatal_tx: mpsc::UnboundedSender<AgentError>,
}

impl AppHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn reload(&self) {
        if self.reload_tx.send(()).is_err() {
            debug!("reload requested after shutdown");
        }
    }

    pub fn fatal(&self, err: AgentError) {
        if self.fatal_tx.send(err).is_err() {
            debug!("fatal error reported after shutdown");
        }
    }
}

/// 顶层监督者：持有全部组件，负责启动、停止、重载
pub struct App {
    settings: Arc<Settings>,
    manager: Arc<ServerManager>,
    health: Option<Arc<HealthChecker>>,
    router: Arc<CommandRouter>,
    cancel: CancellationToken,
    handle: AppHandle,
    reload_rx: mpsc::UnboundedReceiver<()>,
    fatal_rx: mpsc::UnboundedReceiver<AgentError>,
    tasks: Vec<JoinHandle<()>>,
}

fn command_invoker(field: &str, command: &str) -> Result<CommandInvoker, AgentError> {
    CommandSpec::parse(command)
        .map(CommandInvoker::new)
        .map_err(|e| AgentError::ConfigInvalid(format!("{}: {}", field, e)))
}

impl App {
    /// Production wiring: Telegram transport, HTTPS fetcher, whitelisted restart command.
    pub fn new(settings: Settings, settings_path: PathBuf) -> Result<Self, AgentError> {
        let transport = TelegramTransport::new(&settings.bot_token)?;
        let source = HttpFetcher::new()?;
        let restarter = command_invoker("xray_restart_command", &settings.xray_restart_command)?;
        let cache_dir = crate::config::cache_dir(&settings, &settings_path);
        Self::with_parts(
            settings,
            AppParts {
                transport: Arc::new(transport),
                source: Arc::new(source),
                restarter: Arc::new(restarter),
                cache_dir,
            },
        )
    }

    pub fn with_parts(settings: Settings, parts: AppParts) -> Result<Self, AgentError> {
        let updater = settings
            .update_command
            .as_deref()
            .map(|cmd| command_invoker("update_command", cmd))
            .transpose()?;

        let settings = Arc::new(settings);
        let cancel = CancellationToken::new();
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(ServerManager::new(
            settings.subscription_url.clone(),
            parts.source,
            SubscriptionCache::new(parts.cache_dir, settings.cache_ttl()),
            XrayConfigWriter::new(&settings.config_path),
            parts.restarter,
        ));
        let sessions = Arc::new(SessionManager::new(parts.transport, settings.message_timeout()));
        let health = settings.health_interval().map(|interval| {
            Arc::new(HealthChecker::new(
                Arc::clone(&manager),
                ProbeEngine::new(settings.probe_timeout()),
                interval,
            ))
        });
        let router = Arc::new(CommandRouter::new(
            RouterDeps {
                settings: Arc::clone(&settings),
                manager: Arc::clone(&manager),
                sessions,
                probe: ProbeEngine::new(settings.probe_timeout()),
                health: health.clone(),
                updater,
                fatal_tx: fatal_tx.clone(),
            },
            cancel.child_token(),
        ));

        Ok(Self {
            settings,
            manager,
            health,
            router,
            handle: AppHandle {
                cancel: cancel.clone(),
                reload_tx,
                fatal_tx,
            },
            cancel,
            reload_rx,
            fatal_rx,
            tasks: Vec::new(),
        })
    }

    pub fn handle(&self) -> AppHandle {
        self.handle.clone()
    }

    pub fn manager(&self) -> &Arc<ServerManager> {
        &self.manager
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Load the subscription, recover the active server and spawn the workers.
    /// A failed initial load is not fatal: the operator can `/refresh` later.
    pub async fn start(&mut self) {
        match self.manager.load_servers(&self.cancel).await {
            Ok(outcome) => info!(
                servers = outcome.count,
                source = outcome.source.as_str(),
                "subscription loaded"
            ),
            Err(e) => warn!(error = %e, "initial subscription load failed"),
        }
        match self.manager.active_server().await {
            Some(server) => info!(server = %server.name, id = %server.id, "active server recovered"),
            None => info!("no active server detected in proxy config"),
        }

        let router = Arc::clone(&self.router);
        self.tasks.push(tokio::spawn(router.run()));

        if let Some(checker) = &self.health {
            self.tasks.push(checker.spawn(self.cancel.child_token()));
        }

        let router = Arc::clone(&self.router);
        let cancel = self.cancel.child_token();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => router.housekeeping().await,
                }
            }
        }));

        info!(admin = self.settings.admin_id, "xswitch started");
    }

    /// Re-fetch the subscription without touching the chat transport.
    pub async fn reload(&self) -> Result<LoadOutcome, AgentError> {
        info!("reloading subscription");
        let outcome = self.manager.refresh(&self.cancel).await?;
        info!(servers = outcome.count, "reload complete");
        Ok(outcome)
    }

    /// Start, then serve until stopped. A fatal error stops the workers and
    /// is returned to the caller.
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.start().await;

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                Some(err) = self.fatal_rx.recv() => {
                    error!(error = %err, "fatal error, shutting down");
                    break Err(err);
                }
                Some(()) = self.reload_rx.recv() => {
                    if let Err(e) = self.reload().await {
                        warn!(error = %e, "reload failed");
                    }
                }
            }
        };

        self.stop().await;
        result
    }

    /// Cancel every worker and wait up to [`STOP_GRACE`] for them to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(STOP_GRACE, futures_util::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("workers did not stop in time, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
        info!("xswitch stopped");
    }
}
