use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use media_daemon::core::{Coordinator, CoordinatorEvent};
use media_daemon::logging::BroadcastLayer;
use media_daemon::tabs::TabRegistry;
use media_daemon::{http, socket};
use media_proto::config::Config;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Command-line arguments for media-relayd
#[derive(Parser, Debug)]
#[command(name = "media-relayd")]
#[command(about = "Tracks media playing across browser tabs and relays playback commands")]
#[command(version)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "MEDIA_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Also log to stderr
    #[arg(long)]
    stderr: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup broadcast channel first so we can use it for logging
    let (log_tx, _) = broadcast::channel::<String>(100);

    // Setup file logging + broadcast layer
    let data_dir = media_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = args
        .stderr
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(stderr_layer)
        .with(BroadcastLayer::new(log_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,media_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!(
        "Config loaded from: {:?}",
        args.config.clone().unwrap_or_else(Config::config_path)
    );

    // Event channel — all external inputs funnel into the Coordinator
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<CoordinatorEvent>(256);

    let registry = TabRegistry::new();
    let coordinator = Coordinator::new(&config, registry.clone(), event_tx.clone());

    let _socket_handle = socket::start_server(
        config.daemon.bind_address.clone(),
        config.daemon.port,
        registry,
        event_tx.clone(),
        log_tx,
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            event_tx.clone(),
        );
    }

    // Ctrl-C ends the loop
    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(CoordinatorEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    coordinator.run(event_rx).await;

    Ok(())
}
