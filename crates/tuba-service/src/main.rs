//! Tuba Service - fermentation monitor HTTP API.
//!
//! Run with: `cargo run -p tuba-service`

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use tuba_service::config::{SourceKind, default_config_path};
use tuba_service::{AppState, Config, app};
use tuba_store::Store;

/// Tuba Service - batch records, charts and live fermentation monitoring.
#[derive(Parser, Debug)]
#[command(name = "tuba-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "TUBA_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long, global = true, env = "TUBA_BIND")]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long, global = true, env = "TUBA_DATABASE")]
    database: Option<PathBuf>,

    /// Poll an external telemetry bridge at this URL instead of the local
    /// database (overrides config).
    #[arg(long, global = true, env = "TUBA_TELEMETRY_URL")]
    telemetry_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground (default behavior).
    Run,

    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tuba_service=info".parse()?)
                .add_directive("tuba_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::CheckConfig) => {
            println!("Configuration OK");
            println!("  bind:      {}", config.server.bind);
            println!("  database:  {}", config.storage.path.display());
            println!(
                "  telemetry: {}",
                config.telemetry.base_url.as_deref().unwrap_or("local")
            );
            Ok(())
        }
        Some(Command::Run) | None => run_server(config).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            info!("Reading configuration from {:?}", default_config_path());
            Config::load_default()?
        }
    };

    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }
    if let Some(url) = &args.telemetry_url {
        config.telemetry.source = SourceKind::Http;
        config.telemetry.base_url = Some(url.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)?;

    let addr: SocketAddr = config.server.bind.parse()?;
    let state = AppState::new(store, config)?;

    match state.load_history().await {
        Ok(count) => info!("Loaded {} past monitoring sessions", count),
        Err(e) => warn!("Could not load session history: {}", e),
    }

    let router = app(state.clone());

    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Record a session that was still running when the server went down.
    if state.poller.is_polling().await {
        match state.poller.stop().await {
            Ok(session) => {
                if let Err(e) = state.store.lock().await.insert_session(&session) {
                    error!("Failed to persist session {}: {}", session.id, e);
                } else {
                    info!("Recorded session {} for batch {}", session.id, session.batch_id);
                }
            }
            Err(e) => warn!("Failed to stop monitoring: {}", e),
        }
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
