pub mod subscription;
pub mod types;
pub mod xray;

use std::path::{Path, PathBuf};

use crate::common::error::AgentError;

pub use types::{LogLevel, Settings, UiSettings};

pub const DEFAULT_SETTINGS_PATH: &str = "/opt/etc/xswitch/config.json";

/// Read, deserialise and validate the settings file.
pub fn load_settings(path: &Path) -> Result<Settings, AgentError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AgentError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
    })?;
    let settings = parse_settings(&content)?;
    tracing::debug!(path = %path.display(), "settings loaded");
    Ok(settings)
}

pub fn parse_settings(content: &str) -> Result<Settings, AgentError> {
    let settings: Settings = serde_json::from_str(content)
        .map_err(|e| AgentError::ConfigInvalid(format!("malformed settings JSON: {}", e)))?;
    settings.validate()?;
    Ok(settings)
}

/// Directory that holds the log file and the subscription cache by default.
pub fn base_dir(settings_path: &Path) -> PathBuf {
    settings_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn cache_dir(settings: &Settings, settings_path: &Path) -> PathBuf {
    settings
        .cache_dir
        .clone()
        .unwrap_or_else(|| base_dir(settings_path).join("cache"))
}

pub fn log_file(settings: &Settings, settings_path: &Path) -> PathBuf {
    settings
        .log_file
        .clone()
        .unwrap_or_else(|| base_dir(settings_path).join("xswitch.log"))
}
