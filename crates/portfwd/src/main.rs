//! portfwd: dynamically reconfigurable TCP port forwarder.
//!
//! Reads forwarding rules from a JSON file, forwards every enabled rule's
//! local port to its remote address, and re-applies the whole rule set
//! whenever the file changes. Status events go to stdout as JSON lines,
//! logs go to stderr.

mod config;
mod sink;

use anyhow::Result;
use clap::Parser;
use config::Settings;
use portfwd_core::{
    ConfigWatcher, EventSink, FileStore, ForwardingManager, ManagerOptions, NullSink,
};
use sink::JsonLinesSink;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// portfwd: TCP port forwarder driven by a rule file
#[derive(Parser, Debug)]
#[command(name = "portfwd", version, about = "Dynamically reconfigurable TCP port forwarder")]
struct Cli {
    /// Settings file path
    #[arg(long, default_value = "~/.portfwd/portfwd.toml")]
    config: String,

    /// Rule file path (JSON)
    #[arg(long)]
    rules: Option<String>,

    /// How often the rule file is checked for changes, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Do not report status events on stdout
    #[arg(long)]
    no_events: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs on stderr, stdout carries events
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting portfwd");

    let settings_path = PathBuf::from(&cli.config);
    let settings = match Settings::load(
        Some(&settings_path),
        cli.rules.as_deref(),
        cli.poll_interval_ms,
        cli.no_events,
    ) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "failed to load settings");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(settings).await {
        error!(error = %e, "portfwd failed");
        std::process::exit(1);
    }

    info!("portfwd stopped");
}

async fn run(settings: Settings) -> Result<()> {
    let (sink, writer) = if settings.events {
        let (sink, writer) = JsonLinesSink::stdout();
        let sink: Arc<dyn EventSink> = Arc::new(sink);
        (sink, Some(writer))
    } else {
        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        (sink, None)
    };

    let manager = Arc::new(ForwardingManager::new(
        sink,
        ManagerOptions {
            track_activity: settings.events,
        },
    ));
    let store = Arc::new(FileStore::new(&settings.rules_path));
    info!(
        rules = %store.path().display(),
        events = settings.events,
        "using rule file"
    );

    let shutdown = CancellationToken::new();
    let poller = store.spawn_poller(settings.poll_interval, shutdown.clone());
    let watcher =
        tokio::spawn(ConfigWatcher::new(store, Arc::clone(&manager)).run(shutdown.clone()));

    shutdown_signal().await;
    info!("received shutdown signal");
    shutdown.cancel();

    watcher.await?;
    poller.await?;

    // Dropping the last manager reference closes the sink, which lets the
    // event writer drain and exit.
    drop(manager);
    if let Some(writer) = writer {
        writer.await?;
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
