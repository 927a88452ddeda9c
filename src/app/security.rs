use std::path::{Path, PathBuf};

use crate::common::error::AgentError;
use crate::config::types::Settings;

#[derive(Debug, Clone)]
pub struct SecurityWarning {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    pub fix_hint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Block,
    Warn,
    Info,
}

pub struct SecurityReport {
    pub warnings: Vec<SecurityWarning>,
    pub blocked: bool,
}

pub fn audit_settings(settings: &Settings) -> SecurityReport {
    let mut warnings = Vec::new();

    // Plain-HTTP subscription exposes server credentials on the wire
    if settings.subscription_url.trim().starts_with("http://") {
        warnings.push(SecurityWarning {
            severity: Severity::Warn,
            code: "SEC_SUB_PLAINTEXT",
            message: "subscription_url uses plain http".to_string(),
            fix_hint: "Use an https:// subscription URL".to_string(),
        });
    }

    // Credentials in a plain-HTTP URL are readable by anyone on the path
    if let Ok(url) = reqwest::Url::parse(settings.subscription_url.trim()) {
        if url.scheme() == "http" && (!url.username().is_empty() || url.password().is_some()) {
            warnings.push(SecurityWarning {
                severity: Severity::Block,
                code: "SEC_SUB_CREDENTIALS_PLAINTEXT",
                message: "subscription_url sends credentials over plain http".to_string(),
                fix_hint: "Use https:// or drop the user:password part".to_string(),
            });
        }
    }

    if let Some(path) = world_writable(&settings.config_path) {
        warnings.push(SecurityWarning {
            severity: Severity::Block,
            code: "SEC_CONFIG_WORLD_WRITABLE",
            message: format!(
                "{} is world-writable; any local user could rewrite the proxy outbound",
                path.display()
            ),
            fix_hint: format!("chmod o-w {}", path.display()),
        });
    }

    if settings.cache_duration == 0 {
        warnings.push(SecurityWarning {
            severity: Severity::Info,
            code: "CFG_CACHE_DISABLED",
            message: "subscription cache is disabled (cache_duration = 0)".to_string(),
            fix_hint: "Set cache_duration to avoid fetching on every /list".to_string(),
        });
    }

    if settings.health_check_interval == 0 {
        warnings.push(SecurityWarning {
            severity: Severity::Info,
            code: "CFG_HEALTH_DISABLED",
            message: "health checks are disabled".to_string(),
            fix_hint: "Set health_check_interval to a non-zero value".to_string(),
        });
    }

    if settings.config_path.starts_with("/tmp") {
        warnings.push(SecurityWarning {
            severity: Severity::Warn,
            code: "SEC_CONFIG_IN_TMP",
            message: format!(
                "proxy config {} lives in a world-writable directory",
                settings.config_path.display()
            ),
            fix_hint: "Move the proxy config out of /tmp".to_string(),
        });
    }

    let blocked = warnings.iter().any(|w| w.severity == Severity::Block);

    SecurityReport { warnings, blocked }
}

/// The config file, or its directory when not sticky, if others may write to it.
#[cfg(unix)]
fn world_writable(config_path: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    const OTHER_WRITE: u32 = 0o002;
    const STICKY: u32 = 0o1000;

    let mode = |p: &Path| std::fs::metadata(p).ok().map(|m| m.permissions().mode());
    if mode(config_path).is_some_and(|m| m & OTHER_WRITE != 0) {
        return Some(config_path.to_path_buf());
    }
    let dir = config_path.parent()?;
    // /tmp 这类带 sticky 位的目录单独告警
    match mode(dir) {
        Some(m) if m & OTHER_WRITE != 0 && m & STICKY == 0 => Some(dir.to_path_buf()),
        _ => None,
    }
}

#[cfg(not(unix))]
fn world_writable(_config_path: &Path) -> Option<PathBuf> {
    None
}

pub fn mask_sensitive(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        "****".to_string()
    } else {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{}****{}", head, tail)
    }
}

pub fn validate_and_warn(settings: &Settings) -> Result<(), AgentError> {
    let report = audit_settings(settings);

    for w in &report.warnings {
        match w.severity {
            Severity::Block => {
                tracing::error!(code = w.code, fix = w.fix_hint.as_str(), "{}", w.message);
            }
            Severity::Warn => {
                tracing::warn!(code = w.code, fix = w.fix_hint.as_str(), "{}", w.message);
            }
            Severity::Info => {
                tracing::info!(code = w.code, fix = w.fix_hint.as_str(), "{}", w.message);
            }
        }
    }

    if report.blocked {
        return Err(AgentError::ConfigInvalid(format!(
            "security audit blocked startup: {}",
            report
                .warnings
                .iter()
                .filter(|w| w.severity == Severity::Block)
                .map(|w| w.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        )));
    }

    Ok(())
}
