// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! avrflash - keeps the printer board firmware current and serves the update API

use anyhow::{Context, Result};
use avrflash_core::config::DEFAULT_CONFIG_PATH;
use avrflash_core::{
    DetachedSession, DeviceSession, EventBus, HostSession, SettingsStore, Trigger, Updater,
    UpdaterConfig,
};
use avrflash_web::AppState;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(name = "avrflash", version)]
#[command(about = "Firmware updater for AVR-based printer boards", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Do not run the automatic update check at startup
    #[arg(long)]
    skip_startup_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    info!("Starting avrflash {}", env!("CARGO_PKG_VERSION"));

    let config = UpdaterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let paths = config.paths();
    info!("Configuration:");
    info!("   Firmware root: {}", paths.root.display());
    info!("   Port pattern: {}", config.port_pattern);
    info!("   Flash tool: {}", config.flash_command.program);
    info!("   Release feed: {}", config.release_url);
    if let Some(deadline) = config.flash_deadline_secs {
        info!("   Flash deadline: {deadline}s");
    }

    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("Failed to create {}", paths.root.display()))?;
    let settings = Arc::new(
        SettingsStore::load(&paths.settings_file).context("Failed to load updater settings")?,
    );

    let device: Arc<dyn DeviceSession> = match &config.host {
        Some(host) => {
            info!("   Host application: {}", host.base_url);
            Arc::new(HostSession::new(&host.base_url, host.api_key.clone())?)
        }
        None => Arc::new(DetachedSession),
    };
    let updater = Updater::from_config(&config, device, EventBus::new())
        .context("Failed to set up updater")?;

    if cli.skip_startup_check {
        info!("Startup firmware check skipped by command line");
    } else if settings.auto_update_on_startup() {
        match updater.request_update(Trigger::Startup).await {
            Ok(_) => info!("Startup firmware check started"),
            Err(e) => warn!("Startup firmware check not started: {e}"),
        }
    } else {
        info!("Auto-update on startup is disabled");
    }

    let state = AppState {
        updater: updater.clone(),
        settings,
    };
    avrflash_web::start_web_server(state, &config.web, shutdown_signal())
        .await
        .context("Web server failed")?;

    if updater.is_updating() {
        warn!("Exiting while a firmware update is still running");
    }
    info!("Shutting down");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {e}");
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Ctrl-C received");
        }
        () = async {
            match terminate.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => info!("SIGTERM received"),
    }
}
