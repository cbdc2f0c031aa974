mod audit;
mod client;
mod config;
mod feed;
mod reconciler;
mod registry;
mod server;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;

use client::EdgeClient;
use config::{Config, LoggingConfig};
use feed::EventHub;
use reconciler::ReconcilerSettings;
use registry::Registry;
use server::AppState;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (.yaml, .yml or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the socket path from the config
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }

    setup_logging(&config.logging)?;
    log::info!("Starting jobwatch-daemon...");
    log::info!("Upstream: {}", config.upstream.base_url);

    let client = Arc::new(EdgeClient::new(&config.upstream)?);
    let settings = ReconcilerSettings::from_config(&config.reconciler, &config.upstream);
    let hub = EventHub::new(config.reconciler.event_buffer);

    let state = Arc::new(AppState {
        registry: Registry::new(hub, client.clone(), settings),
        jobs: client,
        audit: config.audit.clone(),
    });

    let socket_path = config.server.socket_path.clone();
    let listener = bind_socket(&socket_path)?;
    println!("Listening on {}", socket_path.display());

    tokio::select! {
        result = server::serve(listener, state.clone()) => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Received shutdown signal"),
    }

    state.registry.shutdown().await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        log::warn!("Failed to remove socket {}: {}", socket_path.display(), e);
    }
    log::info!("jobwatch-daemon stopped");
    Ok(())
}

fn bind_socket(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create socket directory {:?}", dir))?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind {:?}", socket_path))?;

    // Set socket permissions to allow all users to connect
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o666);
    std::fs::set_permissions(socket_path, perms)?;

    Ok(listener)
}

fn setup_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(logging.level_filter())
        // Keep HTTP client internals out of debug output
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("reqwest", log::LevelFilter::Info)
        .chain(std::io::stdout());

    if let Some(path) = &logging.output {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
