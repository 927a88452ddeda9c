//! Whitelisted command execution for proxy restarts and updates.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::common::error::AgentError;

pub const MAX_COMMAND_LEN: usize = 256;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Executables a command may start with. Exact paths only, never whole directories.
pub const DEFAULT_WHITELIST: &[&str] = &[
    "/opt/etc/init.d/S24xray",
    "/opt/etc/init.d/S99xkeen",
    "/etc/init.d/xray",
    "/bin/systemctl",
    "/usr/bin/systemctl",
    "/sbin/service",
    "/usr/sbin/service",
    "/opt/sbin/xkeen",
    "/opt/bin/xkeen",
];

const SHELL_METACHARS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>', '\'', '"', '\\'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,
    #[error("command exceeds {MAX_COMMAND_LEN} bytes")]
    TooLong,
    #[error("command contains shell metacharacter '{0}'")]
    Metachar(char),
    #[error("executable must be an absolute path without '..': {0}")]
    BadPath(String),
    #[error("executable not whitelisted: {0}")]
    NotWhitelisted(String),
}

/// A statically checked command line: program + arguments, never passed to a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn parse(command: &str) -> Result<Self, CommandError> {
        Self::parse_with(command, DEFAULT_WHITELIST)
    }

    pub fn parse_with(command: &str, whitelist: &[&str]) -> Result<Self, CommandError> {
        if command.len() > MAX_COMMAND_LEN {
            return Err(CommandError::TooLong);
        }
        if let Some(c) = command.chars().find(|c| SHELL_METACHARS.contains(c)) {
            return Err(CommandError::Metachar(c));
        }

        let mut tokens = command.split_whitespace();
        let program = tokens.next().ok_or(CommandError::Empty)?;
        if !program.starts_with('/') || program.split('/').any(|seg| seg == "..") {
            return Err(CommandError::BadPath(program.to_string()));
        }

        if !whitelist.contains(&program) {
            return Err(CommandError::NotWhitelisted(program.to_string()));
        }

        Ok(Self {
            program: program.to_string(),
            args: tokens.map(str::to_string).collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Restart capability used by the switch flow. Mocked in tests.
#[async_trait]
pub trait ProxyRestarter: Send + Sync {
    async fn restart(&self) -> Result<(), AgentError>;
}

/// Runs a [`CommandSpec`] with a timeout; non-zero exit is an error.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    spec: CommandSpec,
    timeout: Duration,
}

impl CommandInvoker {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Returns trimmed stdout on success; stderr (or the exit status) on failure.
    pub async fn run(&self) -> Result<String, String> {
        let start = Instant::now();
        debug!(command = %self.spec.display(), "spawning command");

        let child = tokio::process::Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawn {}: {}", self.spec.program, e))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("wait failed: {}", e))?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if output.status.success() {
            info!(command = %self.spec.display(), elapsed_ms, "command finished");
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let status = match output.status.code() {
                Some(code) => format!("exit code {}", code),
                None => "killed by signal".to_string(),
            };
            warn!(command = %self.spec.display(), %status, elapsed_ms, "command failed");
            if stderr.is_empty() {
                Err(status)
            } else {
                Err(format!("{}: {}", status, truncate(&stderr, 200)))
            }
        }
    }
}

#[async_trait]
impl ProxyRestarter for CommandInvoker {
    async fn restart(&self) -> Result<(), AgentError> {
        self.run().await.map(|_| ()).map_err(AgentError::RestartFailed)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
