//! Maps chat updates to handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::health::HealthChecker;
use crate::app::manager::{ServerManager, ServerSnapshot};
use crate::app::name_optimizer::optimize_names;
use crate::app::probe::{sort_by_latency, ProbeEngine, ProbeProgress, ProgressFn};
use crate::app::restart::CommandInvoker;
use crate::app::status::StatusReport;
use crate::bot::keyboard::{self, Callback, ConfirmAction, ServerLabel};
use crate::bot::messages;
use crate::bot::rate_limit::CommandLimiter;
use crate::bot::session::SessionManager;
use crate::bot::transport::{
    Button, ChatError, ChatId, ChatTransport, InlineKeyboard, MessageContent, MessageType, Update,
    UpdateKind,
};
use crate::common::error::AgentError;
use crate::config::types::Settings;

pub const POLL_TIMEOUT: Duration = Duration::from_secs(25);
pub const PROGRESS_EDIT_INTERVAL: Duration = Duration::from_secs(1);
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Everything the router talks to.
pub struct RouterDeps {
    pub settings: Arc<Settings>,
    pub manager: Arc<ServerManager>,
    pub sessions: Arc<SessionManager>,
    pub probe: ProbeEngine,
    pub health: Option<Arc<HealthChecker>>,
    pub updater: Option<CommandInvoker>,
    /// Fatal errors go to the supervisor.
    pub fatal_tx: mpsc::UnboundedSender<AgentError>,
}

/// How a handler presents its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    /// Typed command: post at the bottom of the chat.
    New,
    /// Button press: edit the live message when possible.
    Edit,
}

pub struct CommandRouter {
    settings: Arc<Settings>,
    manager: Arc<ServerManager>,
    sessions: Arc<SessionManager>,
    probe: ProbeEngine,
    health: Option<Arc<HealthChecker>>,
    updater: Option<CommandInvoker>,
    fatal_tx: mpsc::UnboundedSender<AgentError>,
    limiter: CommandLimiter,
    cancel: CancellationToken,
}

impl CommandRouter {
    pub fn new(deps: RouterDeps, cancel: CancellationToken) -> Self {
        Self {
            settings: deps.settings,
            manager: deps.manager,
            sessions: deps.sessions,
            probe: deps.probe,
            health: deps.health,
            updater: deps.updater,
            fatal_tx: deps.fatal_tx,
            limiter: CommandLimiter::default(),
            cancel,
        }
    }

    fn transport(&self) -> &Arc<dyn ChatTransport> {
        self.sessions.transport()
    }

    /// Long-poll loop. Each update is handled on its own task so a slow
    /// handler (ping sweep, restart) does not stall polling.
    pub async fn run(self: Arc<Self>) {
        let mut offset = 0i64;
        info!("bot polling started");
        while !self.cancel.is_cancelled() {
            let batch = match self
                .transport()
                .poll_updates(offset, POLL_TIMEOUT, &self.cancel)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "poll failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                    }
                }
            };
            offset = offset.max(batch.next_offset);
            for update in batch.updates {
                offset = offset.max(update.update_id + 1);
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.handle_update(update).await });
            }
        }
        info!("bot polling stopped");
    }

    /// Periodic upkeep: expired chat messages and idle rate-limit windows.
    pub async fn housekeeping(&self) {
        self.housekeeping_at(Instant::now()).await;
    }

    async fn housekeeping_at(&self, now: Instant) {
        let removed = self.sessions.cleanup_expired_at(now).await;
        self.limiter.prune_at(now);
        if removed > 0 {
            debug!(removed, limited_users = self.limiter.tracked(), "housekeeping done");
        }
    }

    pub async fn handle_update(&self, update: Update) {
        if update.user_id != self.settings.admin_id {
            warn!(user = update.user_id, "unauthorised access attempt");
            self.reject(&update, messages::UNAUTHORISED).await;
            return;
        }
        if !self.limiter.check(update.user_id) {
            debug!(user = update.user_id, "command rate limited");
            self.reject(&update, messages::RATE_LIMITED).await;
            return;
        }

        let chat = update.chat_id;
        let result = match update.kind {
            UpdateKind::Text(text) => self.handle_text(chat, &text).await,
            UpdateKind::Callback { query_id, data, .. } => {
                if let Err(e) = self.transport().answer_callback(&query_id, None).await {
                    debug!(error = %e, "answer callback failed");
                }
                self.handle_callback(chat, &data).await
            }
        };
        if let Err(e) = result {
            warn!(chat, error = %e, "reply failed");
        }
    }

    /// Reply outside the session machinery; no session is created.
    async fn reject(&self, update: &Update, text: &str) {
        let result = match &update.kind {
            UpdateKind::Callback { query_id, .. } => {
                self.transport().answer_callback(query_id, Some(text)).await
            }
            UpdateKind::Text(_) => self
                .transport()
                .send_message(update.chat_id, text, None)
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            debug!(error = %e, "reject reply failed");
        }
    }

    async fn handle_text(&self, chat: ChatId, text: &str) -> Result<(), ChatError> {
        let command = text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default();
        debug!(chat, command, "text command");
        match command {
            "/start" | "/menu" => self.show_menu(chat, Reply::New, None).await,
            "/list" => self.show_list(chat, 0, Reply::New).await,
            "/status" => self.show_status(chat, Reply::New).await,
            "/ping" => self.run_ping(chat, Reply::New).await,
            "/refresh" => self.refresh(chat, Reply::New).await,
            "/update" => self.ask_update(chat, Reply::New).await,
            _ => {
                let content = MessageContent::new(MessageType::Menu, messages::help())
                    .with_keyboard(keyboard::back_to_menu());
                self.reply(chat, Reply::New, content).await
            }
        }
    }

    async fn handle_callback(&self, chat: ChatId, data: &str) -> Result<(), ChatError> {
        let Some(callback) = Callback::parse(data) else {
            debug!(chat, data, "unknown callback");
            return self.show_menu(chat, Reply::Edit, None).await;
        };
        debug!(chat, data, "callback");
        match callback {
            Callback::Menu => self.show_menu(chat, Reply::Edit, None).await,
            Callback::Page(page) => self.show_list(chat, page, Reply::Edit).await,
            Callback::Status => self.show_status(chat, Reply::Edit).await,
            Callback::Ping => self.run_ping(chat, Reply::Edit).await,
            Callback::Refresh => self.refresh(chat, Reply::Edit).await,
            Callback::Server(id) => self.ask_switch(chat, &id).await,
            Callback::Quick(id) | Callback::Confirm(ConfirmAction::Switch(id)) => {
                self.switch(chat, &id).await
            }
            Callback::Confirm(ConfirmAction::Update) => self.run_update(chat).await,
            Callback::Cancel => {
                self.show_menu(chat, Reply::Edit, Some(messages::CANCELLED))
                    .await
            }
        }
    }

    async fn reply(&self, chat: ChatId, mode: Reply, content: MessageContent) -> Result<(), ChatError> {
        let sent = match mode {
            Reply::New => self.sessions.send_new(chat, &content).await,
            Reply::Edit => self.sessions.send_or_edit(chat, &content).await,
        };
        sent.map(|_| ())
    }

    async fn reply_error(&self, chat: ChatId, mode: Reply, err: &AgentError) -> Result<(), ChatError> {
        let content = MessageContent::new(MessageType::Error, messages::error(err))
            .with_keyboard(keyboard::back_to_menu());
        self.reply(chat, mode, content).await
    }

    /// Current snapshot, loading the subscription first when nothing is loaded yet.
    async fn ensure_loaded(&self) -> Result<ServerSnapshot, AgentError> {
        let snapshot = self.manager.snapshot().await;
        if !snapshot.servers.is_empty() {
            return Ok(snapshot);
        }
        self.manager.load_servers(&self.cancel).await?;
        Ok(self.manager.snapshot().await)
    }

    fn labels(&self, snapshot: &ServerSnapshot) -> Vec<ServerLabel> {
        let names: Vec<String> = snapshot.servers.iter().map(|s| s.name.clone()).collect();
        let names = if self.settings.ui.enable_name_optimization {
            optimize_names(&names, self.settings.ui.name_optimization_threshold).names
        } else {
            names
        };
        snapshot
            .servers
            .iter()
            .zip(names)
            .map(|(server, label)| ServerLabel {
                id: server.id.clone(),
                label,
                active: snapshot.active.as_deref() == Some(server.id.as_str()),
            })
            .collect()
    }

    async fn show_menu(&self, chat: ChatId, mode: Reply, note: Option<&str>) -> Result<(), ChatError> {
        // 菜单在订阅不可用时也要能显示
        let snapshot = match self.ensure_loaded().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "subscription unavailable for menu");
                self.manager.snapshot().await
            }
        };
        let labels = self.labels(&snapshot);
        let quick: Vec<ServerLabel> = labels
            .into_iter()
            .take(self.settings.ui.max_quick_select_servers)
            .collect();

        let mut text = messages::menu(snapshot.active_server(), snapshot.servers.len());
        if let Some(note) = note {
            text = format!("{}\n\n{}", note, text);
        }
        let content = MessageContent::new(MessageType::Menu, text).with_keyboard(keyboard::main_menu(
            &quick,
            self.settings.ui.max_button_text_length,
        ));
        self.reply(chat, mode, content).await
    }

    async fn show_list(&self, chat: ChatId, page: usize, mode: Reply) -> Result<(), ChatError> {
        let snapshot = match self.ensure_loaded().await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.reply_error(chat, mode, &e).await,
        };
        let labels = self.labels(&snapshot);
        let per_page = self.settings.ui.servers_per_page;
        let (kb, page) = keyboard::server_list(
            &labels,
            page,
            per_page,
            self.settings.ui.max_button_text_length,
        );
        let text = messages::server_list(
            page,
            keyboard::total_pages(labels.len(), per_page),
            labels.len(),
        );
        let content = MessageContent::new(MessageType::ServerList, text).with_keyboard(kb);
        self.reply(chat, mode, content).await
    }

    async fn show_status(&self, chat: ChatId, mode: Reply) -> Result<(), ChatError> {
        let snapshot = self.manager.snapshot().await;
        let health = match &self.health {
            Some(checker) => checker.last().await,
            None => None,
        };
        let report = StatusReport::build(&self.settings, !self.cancel.is_cancelled(), &snapshot, health);
        let content = MessageContent::new(MessageType::Status, messages::status(&report))
            .with_keyboard(keyboard::back_to_menu());
        self.reply(chat, mode, content).await
    }

    async fn run_ping(&self, chat: ChatId, mode: Reply) -> Result<(), ChatError> {
        let snapshot = match self.ensure_loaded().await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.reply_error(chat, mode, &e).await,
        };
        let servers = snapshot.servers;
        let total = servers.len();

        let initial = MessageContent::new(MessageType::Progress, messages::ping_progress(0, total, None));
        self.reply(chat, mode, initial).await?;

        let (tx, rx) = watch::channel::<Option<ProbeProgress>>(None);
        let progress: ProgressFn = Arc::new(move |p| {
            tx.send_replace(Some(p));
        });

        let done = CancellationToken::new();
        let editor = tokio::spawn(edit_progress(
            Arc::clone(&self.sessions),
            chat,
            rx,
            done.clone(),
        ));

        let mut results = self.probe.probe_all(&servers, Some(progress), &self.cancel).await;
        done.cancel();
        if let Err(e) = editor.await {
            debug!(error = %e, "progress editor task failed");
        }

        sort_by_latency(&mut results);
        let kb = InlineKeyboard::new().row(vec![
            Button::new("📡 Ещё раз", Callback::Ping.data()),
            keyboard::back_button(),
        ]);
        let content = MessageContent::new(MessageType::PingResult, messages::ping_results(&results))
            .with_keyboard(kb);
        self.sessions.send_or_edit(chat, &content).await.map(|_| ())
    }

    async fn refresh(&self, chat: ChatId, mode: Reply) -> Result<(), ChatError> {
        let content = match self.manager.refresh(&self.cancel).await {
            Ok(outcome) => MessageContent::new(MessageType::Status, messages::loaded(&outcome))
                .with_keyboard(
                    InlineKeyboard::new()
                        .row(vec![Button::new("📋 Серверы", Callback::Page(0).data())])
                        .row(vec![keyboard::back_button()]),
                ),
            Err(e) => {
                warn!(error = %e, "subscription refresh failed");
                return self.reply_error(chat, mode, &e).await;
            }
        };
        self.reply(chat, mode, content).await
    }

    async fn ask_switch(&self, chat: ChatId, id: &str) -> Result<(), ChatError> {
        let Some(server) = self.manager.server(id).await else {
            return self
                .reply_error(chat, Reply::Edit, &AgentError::ServerNotFound(id.to_string()))
                .await;
        };
        let content = MessageContent::new(MessageType::Confirmation, messages::confirm_switch(&server))
            .with_keyboard(keyboard::confirm_switch(&server.id));
        self.reply(chat, Reply::Edit, content).await
    }

    async fn switch(&self, chat: ChatId, id: &str) -> Result<(), ChatError> {
        if let Some(server) = self.manager.server(id).await {
            let progress = MessageContent::new(MessageType::Progress, messages::switching(&server));
            self.reply(chat, Reply::Edit, progress).await?;
        }

        match self.manager.switch(id).await {
            Ok(server) => {
                let content = MessageContent::new(MessageType::Status, messages::switched(&server))
                    .with_keyboard(keyboard::back_to_menu());
                self.reply(chat, Reply::Edit, content).await
            }
            Err(e) => {
                let reply = self.reply_error(chat, Reply::Edit, &e).await;
                if e.is_fatal() {
                    error!(error = %e, "fatal error during switch");
                    if self.fatal_tx.send(e).is_err() {
                        error!("supervisor is gone, fatal error not delivered");
                    }
                }
                reply
            }
        }
    }

    async fn ask_update(&self, chat: ChatId, mode: Reply) -> Result<(), ChatError> {
        let content = if self.updater.is_some() {
            MessageContent::new(MessageType::Confirmation, messages::update_confirm())
                .with_keyboard(keyboard::confirm_update())
        } else {
            MessageContent::new(MessageType::Status, messages::UPDATE_NOT_CONFIGURED)
                .with_keyboard(keyboard::back_to_menu())
        };
        self.reply(chat, mode, content).await
    }

    async fn run_update(&self, chat: ChatId) -> Result<(), ChatError> {
        let Some(updater) = &self.updater else {
            return self.ask_update(chat, Reply::Edit).await;
        };
        self.reply(
            chat,
            Reply::Edit,
            MessageContent::new(MessageType::Progress, messages::update_started()),
        )
        .await?;

        info!(command = %updater.spec().display(), "running update command");
        let text = match updater.run().await {
            Ok(output) => messages::update_done(&output),
            Err(reason) => {
                warn!(reason = %reason, "update command failed");
                messages::update_failed(&reason)
            }
        };
        let content = MessageContent::new(MessageType::Status, text).with_keyboard(keyboard::back_to_menu());
        self.reply(chat, Reply::Edit, content).await
    }
}

/// Edits the progress message with the latest probe progress, at most once
/// per [`PROGRESS_EDIT_INTERVAL`].
async fn edit_progress(
    sessions: Arc<SessionManager>,
    chat: ChatId,
    mut rx: watch::Receiver<Option<ProbeProgress>>,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(PROGRESS_EDIT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = ticker.tick() => {
                if !rx.has_changed().unwrap_or(false) {
                    continue;
                }
                let latest = rx.borrow_and_update().clone();
                let Some(p) = latest else { continue };
                let content = MessageContent::new(
                    MessageType::Progress,
                    messages::ping_progress(p.completed, p.total, Some(&p.last_server)),
                );
                if let Err(e) = sessions.send_or_edit(chat, &content).await {
                    debug!(error = %e, "progress edit failed");
                }
            }
        }
    }
}
