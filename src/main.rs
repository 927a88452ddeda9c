use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use xswitch::app::security::{audit_settings, mask_sensitive, validate_and_warn};
use xswitch::app::{App, AppHandle};
use xswitch::config::{self, Settings, DEFAULT_SETTINGS_PATH};

#[derive(Parser, Debug)]
#[command(name = "xswitch", version, about = "Telegram-controlled Xray outbound switcher")]
struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    /// Validate the settings file and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match config::load_settings(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("xswitch: {}", e);
            return ExitCode::from(1);
        }
    };

    if cli.check {
        return print_check(&settings, &cli.config);
    }

    init_tracing(&settings, &cli.config);
    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "xswitch starting");

    let app = match validate_and_warn(&settings).and_then(|()| App::new(settings, cli.config.clone())) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = install_signals(app.handle()) {
        error!(error = %e, "startup failed");
        return ExitCode::from(1);
    }

    match app.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, kind = e.kind().as_str(), "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

/// RUST_LOG wins over `log_level`. The log file is optional.
fn init_tracing(settings: &Settings, settings_path: &Path) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));

    let path = config::log_file(settings, settings_path);
    let file = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(&path));
    let (file_layer, file_err) = match file {
        Ok(file) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some(e) = file_err {
        warn!(path = %path.display(), error = %e, "log file unavailable, logging to stderr only");
    }
}

fn install_signals(handle: AppHandle) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("SIGINT received, stopping");
                    handle.stop();
                    break;
                }
                _ = terminate.recv() => {
                    info!("SIGTERM received, stopping");
                    handle.stop();
                    break;
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading");
                    handle.reload();
                }
            }
        }
    });
    Ok(())
}

fn print_check(settings: &Settings, settings_path: &Path) -> ExitCode {
    println!("settings:        {}", settings_path.display());
    println!("admin_id:        {}", settings.admin_id);
    println!("bot_token:       {}", mask_sensitive(&settings.bot_token));
    println!("subscription:    {}", mask_sensitive(&settings.subscription_url));
    println!("xray config:     {}", settings.config_path.display());
    println!("restart command: {}", settings.xray_restart_command);
    println!(
        "update command:  {}",
        settings.update_command.as_deref().unwrap_or("-")
    );
    println!("cache:           {} ({} s)", config::cache_dir(settings, settings_path).display(), settings.cache_duration);
    println!("log file:        {}", config::log_file(settings, settings_path).display());
    println!("health interval: {} s", settings.health_check_interval);
    println!("ping timeout:    {} s", settings.ping_timeout);

    let report = audit_settings(settings);
    for w in &report.warnings {
        println!("[{:?}] {}: {} ({})", w.severity, w.code, w.message, w.fix_hint);
    }
    if report.blocked {
        println!("settings rejected");
        ExitCode::from(1)
    } else {
        println!("settings OK");
        ExitCode::SUCCESS
    }
}
