//! Show Status Daemon - Headless Light Show Status Watcher
//!
//! Runs the status engine against the live feeds and logs what a visitor
//! would see: connectivity transitions, notices and the speaker state. The
//! visitor record is restored on start and written back on every request.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/showstatus/status.toml if present)
//! showstatus-daemon
//!
//! # Point at the feeds directly
//! showstatus-daemon --show-url http://show.local/api --controller-url http://fpp.local/api
//!
//! # One poll cycle, derived state printed as JSON
//! showstatus-daemon --once
//!
//! # Verbose logging
//! RUST_LOG=debug showstatus-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop polling and exit

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use showstatus_core::adapters::{HttpPlaybackAdapter, HttpShowAdapter, HttpSpeakerAdapter};
use showstatus_core::config::{default_config_path, load_config_from_path};
use showstatus_core::session_store::load_visitor;
use showstatus_core::state::reason;
use showstatus_core::{
    ConfigSource, FileSessionStore, Poller, SharedClock, SpeakerCoordinator, StateMachine,
    StatusConfig, SystemClock,
};

/// Show Status Daemon - status watcher for a holiday light show
#[derive(Parser, Debug)]
#[command(name = "showstatus-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SHOWSTATUS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Show-control feed URL
    #[arg(long, value_name = "URL")]
    show_url: Option<String>,

    /// Playback-controller feed URL
    #[arg(long, value_name = "URL")]
    controller_url: Option<String>,

    /// Speaker feed URL
    #[arg(long, value_name = "URL")]
    speaker_url: Option<String>,

    /// Interval between poll cycles in milliseconds
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Visitor record location
    #[arg(long, value_name = "PATH")]
    session_file: Option<PathBuf>,

    /// Run a single poll cycle, print the derived state and exit
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SHOWSTATUS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Apply command-line overrides on top of file and environment config
    fn apply(&self, config: &mut StatusConfig) -> Result<()> {
        let mut overridden = false;
        if let Some(url) = &self.show_url {
            config.endpoints.show_url = Some(url.clone());
            overridden = true;
        }
        if let Some(url) = &self.controller_url {
            config.endpoints.controller_url = Some(url.clone());
            overridden = true;
        }
        if let Some(url) = &self.speaker_url {
            config.endpoints.speaker_url = Some(url.clone());
            overridden = true;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
            overridden = true;
        }
        if let Some(path) = &self.session_file {
            config.session_file = Some(path.clone());
            overridden = true;
        }
        if overridden {
            config.set_source(ConfigSource::Cli);
            config.validate().context("Invalid command-line overrides")?;
        }
        Ok(())
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "showstatus_daemon={level},showstatus_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .init();
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            info!("Received SIGINT, shutting down");
        }
    }
    Ok(())
}

/// Log transitions and notices
fn log_changes(machine: &StateMachine) {
    machine.subscribe(|change| {
        if change.transitioned() {
            info!(
                from = %change.from,
                to = %change.to,
                reason = %change.reason,
                "Connectivity changed"
            );
        } else {
            debug!(state = %change.to, reason = %change.reason, "State updated");
        }
        if let Some(notice) = &change.snapshot.notice {
            if change.reason == reason::NOTICE {
                warn!(message = %notice.message, "Notice");
            }
        }
        Ok(())
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Show status daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.apply(&mut config)?;
    info!(
        source = %config.source(),
        poll_interval = ?config.poll_interval,
        "Configuration loaded"
    );
    if config.endpoints.show_url.is_none() || config.endpoints.controller_url.is_none() {
        warn!("Feed URLs missing; unconfigured feeds report failures every cycle");
    }

    let clock: SharedClock = Arc::new(SystemClock);
    let store = config.session_file.clone().map(FileSessionStore::new);
    let visitor = match &store {
        Some(store) => load_visitor(store, clock.now_ms(), config.recent_request_ttl).await,
        None => showstatus_core::VisitorSession::new(clock.now_ms()),
    };
    info!(visitor = %visitor.visitor_id, "Visitor session ready");

    let endpoints = config.endpoints.clone();
    let machine = Arc::new(StateMachine::with_visitor(config, clock.clone(), visitor));
    log_changes(&machine);

    let show = Arc::new(HttpShowAdapter::new(
        endpoints.show_url,
        endpoints.timeout,
        clock.clone(),
    ));
    let playback = Arc::new(HttpPlaybackAdapter::new(
        endpoints.controller_url,
        endpoints.timeout,
        clock.clone(),
    ));
    let speaker = Arc::new(HttpSpeakerAdapter::new(
        endpoints.speaker_url,
        endpoints.timeout,
        clock.clone(),
    ));
    let coordinator = SpeakerCoordinator::new(machine.clone(), speaker.clone());
    let poller = Poller::new(
        machine.clone(),
        show,
        playback,
        speaker,
        Some(coordinator.clone()),
    );

    if args.once {
        poller.poll_once().await;
        let report = serde_json::json!({
            "connectivity": machine.connectivity(),
            "derived": machine.get_derived_state(),
            "speaker": coordinator.display(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    poller.start_polling();
    let result = shutdown_signal().await;
    poller.stop_polling();

    info!(cycles = poller.cycles(), "Show status daemon stopped");
    result
}
