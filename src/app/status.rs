use std::path::PathBuf;

use serde::Serialize;

use crate::app::cache::unix_now;
use crate::app::health::{HealthReport, HealthStatus};
use crate::app::manager::ServerSnapshot;
use crate::config::types::{LogLevel, Settings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentServer {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthInfo {
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_check: Option<u64>,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    pub fetched_at: u64,
    pub age_secs: u64,
}

/// Everything `/status` shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub config_path: PathBuf,
    pub log_level: LogLevel,
    pub admin_id: i64,
    pub servers_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_server: Option<CurrentServer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheInfo>,
}

impl StatusReport {
    pub fn build(
        settings: &Settings,
        running: bool,
        snapshot: &ServerSnapshot,
        health: Option<HealthReport>,
    ) -> Self {
        let current_server = snapshot.active_server().map(|s| CurrentServer {
            id: s.id.clone(),
            name: s.name.clone(),
        });
        let health = Some(HealthInfo {
            enabled: settings.health_interval().is_some(),
            interval_secs: settings.health_check_interval,
            last_check: health.as_ref().map(|h| h.checked_at),
            status: health.map(|h| h.status).unwrap_or(HealthStatus::Unknown),
        });
        let cache = snapshot.fetched_at.map(|fetched_at| CacheInfo {
            fetched_at,
            age_secs: unix_now().saturating_sub(fetched_at),
        });
        Self {
            running,
            config_path: settings.config_path.clone(),
            log_level: settings.log_level,
            admin_id: settings.admin_id,
            servers_count: snapshot.servers.len(),
            current_server,
            health,
            cache,
        }
    }
}
