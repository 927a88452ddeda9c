use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::app::restart::CommandSpec;
use crate::common::error::AgentError;

/// Operator-supplied parameters. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub admin_id: i64,
    pub bot_token: String,
    pub subscription_url: String,
    pub config_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "default_restart_command")]
    pub xray_restart_command: String,
    /// Seconds a fetched subscription stays fresh. 0 disables caching.
    #[serde(default = "default_cache_duration")]
    pub cache_duration: u64,
    /// Seconds between health checks. 0 disables the checker.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default)]
    pub ui: UiSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiSettings {
    #[serde(default = "default_max_button_text_length")]
    pub max_button_text_length: usize,
    #[serde(default = "default_servers_per_page")]
    pub servers_per_page: usize,
    #[serde(default = "default_max_quick_select_servers")]
    pub max_quick_select_servers: usize,
    #[serde(default = "default_message_timeout_minutes")]
    pub message_timeout_minutes: u64,
    #[serde(default = "default_true")]
    pub enable_name_optimization: bool,
    #[serde(default = "default_name_optimization_threshold")]
    pub name_optimization_threshold: f64,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            max_button_text_length: default_max_button_text_length(),
            servers_per_page: default_servers_per_page(),
            max_quick_select_servers: default_max_quick_select_servers(),
            message_timeout_minutes: default_message_timeout_minutes(),
            enable_name_optimization: true,
            name_optimization_threshold: default_name_optimization_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_restart_command() -> String {
    "/opt/etc/init.d/S24xray restart".to_string()
}

fn default_cache_duration() -> u64 {
    3600
}

fn default_health_check_interval() -> u64 {
    300
}

fn default_ping_timeout() -> u64 {
    5
}

fn default_max_button_text_length() -> usize {
    30
}

fn default_servers_per_page() -> usize {
    8
}

fn default_max_quick_select_servers() -> usize {
    5
}

fn default_message_timeout_minutes() -> u64 {
    60
}

fn default_name_optimization_threshold() -> f64 {
    0.7
}

fn bot_token_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{8,10}:[A-Za-z0-9_-]{20,}$").ok())
        .as_ref()
}

fn invalid(msg: impl Into<String>) -> AgentError {
    AgentError::ConfigInvalid(msg.into())
}

impl Settings {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.admin_id <= 0 {
            return Err(invalid("admin_id must be a positive integer"));
        }
        // 只做形状检查，真实 token 的位数会变化
        let token_ok = bot_token_regex()
            .map(|re| re.is_match(&self.bot_token))
            .unwrap_or(false);
        if !token_ok {
            return Err(invalid("bot_token has an unexpected format"));
        }

        let url = reqwest::Url::parse(self.subscription_url.trim())
            .map_err(|e| invalid(format!("subscription_url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("subscription_url must start with http:// or https://"));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("subscription_url has no host"));
        }

        validate_abs_path("config_path", &self.config_path)?;
        if let Some(dir) = &self.cache_dir {
            validate_abs_path("cache_dir", dir)?;
        }
        if let Some(file) = &self.log_file {
            validate_abs_path("log_file", file)?;
        }

        CommandSpec::parse(&self.xray_restart_command)
            .map_err(|e| invalid(format!("xray_restart_command: {}", e)))?;
        if let Some(cmd) = &self.update_command {
            CommandSpec::parse(cmd).map_err(|e| invalid(format!("update_command: {}", e)))?;
        }

        if self.cache_duration > 86_400 {
            return Err(invalid("cache_duration must be within 0..86400 seconds"));
        }
        if self.health_check_interval > 3_600 {
            return Err(invalid("health_check_interval must be within 0..3600 seconds"));
        }
        if !(1..=60).contains(&self.ping_timeout) {
            return Err(invalid("ping_timeout must be within 1..60 seconds"));
        }

        self.ui.validate()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_duration)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        match self.health_check_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.ui.message_timeout_minutes * 60)
    }
}

impl UiSettings {
    pub fn validate(&self) -> Result<(), AgentError> {
        if !(1..=200).contains(&self.max_button_text_length) {
            return Err(invalid("ui.max_button_text_length must be within 1..200"));
        }
        if !(1..=100).contains(&self.servers_per_page) {
            return Err(invalid("ui.servers_per_page must be within 1..100"));
        }
        if !(1..=50).contains(&self.max_quick_select_servers) {
            return Err(invalid("ui.max_quick_select_servers must be within 1..50"));
        }
        if !(1..=1440).contains(&self.message_timeout_minutes) {
            return Err(invalid("ui.message_timeout_minutes must be within 1..1440"));
        }
        if !(0.0..=1.0).contains(&self.name_optimization_threshold) {
            return Err(invalid("ui.name_optimization_threshold must be within 0..1"));
        }
        Ok(())
    }
}

fn validate_abs_path(field: &str, path: &Path) -> Result<(), AgentError> {
    if !path.is_absolute() {
        return Err(invalid(format!("{} must be an absolute path", field)));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid(format!("{} must not contain '..'", field)));
    }
    Ok(())
}
