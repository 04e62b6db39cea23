//! tanksyncd - Aquarium telemetry sync daemon and HTTP API.
//!
//! Run with: `cargo run -p tanksync-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tanksync_core::{ReadingStore, Sources, SyncCoordinator};
use tanksync_service::{AlertLog, AppState, Config, Maintenance, TankSimulator, api};
use tanksync_store::SnapshotDb;

/// tanksyncd - Aquarium telemetry sync daemon and HTTP REST API.
#[derive(Parser, Debug)]
#[command(name = "tanksyncd")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long, global = true)]
    bind: Option<String>,

    /// Snapshot database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground (default behavior).
    Run,

    /// Validate the configuration and print the sensors it syncs.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Some(Command::CheckConfig) => check_config(&config),
        Some(Command::Run) | None => run_server(config).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Override config with CLI args
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }

    config.validate()?;
    Ok(config)
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration is valid");
    println!("  bind:     {}", config.server.bind);
    println!("  database: {}", config.storage.path.display());
    for sensor in config.effective_sensors() {
        let metric = sensor
            .resolved_metric()
            .map(|m| m.as_str())
            .unwrap_or("unknown");
        match &sensor.alias {
            Some(alias) => println!("  sensor:   {} ({}, {})", sensor.id, metric, alias),
            None => println!("  sensor:   {} ({})", sensor.id, metric),
        }
    }
    Ok(())
}

fn open_snapshot(config: &Config) -> anyhow::Result<(SnapshotDb, ReadingStore)> {
    info!("Opening snapshot database at {:?}", config.storage.path);
    let db = SnapshotDb::open(&config.storage.path)
        .with_context(|| format!("opening {}", config.storage.path.display()))?;
    let store = match db.load() {
        Ok(store) => {
            info!(readings = store.len(), "Restored cached readings");
            store
        }
        Err(e) => {
            warn!("Ignoring unreadable snapshot: {}", e);
            ReadingStore::default()
        }
    };
    Ok((db, store))
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tanksync_service=info".parse()?)
                .add_directive("tanksync_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let (db, store) = open_snapshot(&config)?;

    let simulator = Arc::new(TankSimulator::new(config.simulation.clone()));
    let sources = Sources::new(simulator.clone(), simulator.clone(), simulator);
    let coordinator = SyncCoordinator::with_store(sources, config.sync_config(), store)?;

    for sensor in config.effective_sensors() {
        coordinator
            .subscribe_with_metric(&sensor.id, sensor.resolved_metric())
            .await?;
    }
    info!(sensors = config.effective_sensors().len(), "Subscribed sensors");

    let cancel = CancellationToken::new();
    let alerts = tokio::spawn(AlertLog::new(&config.alerts).run(coordinator.events(), cancel.clone()));
    let maintenance = tokio::spawn(
        Maintenance::new(coordinator.clone(), db, config.storage.clone()).run(cancel.clone()),
    );

    let state = AppState::new(coordinator.clone(), config.clone());

    // Build the router
    let app = Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Parse bind address
    let addr: SocketAddr = config.server.bind.parse()?;

    info!("Starting server on {}", addr);

    // Run the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
        })
        .await?;

    // Stop the workers first so the final snapshot sees everything applied
    coordinator.shutdown().await;
    cancel.cancel();
    let _ = alerts.await;
    maintenance.await.context("maintenance task panicked")?;

    Ok(())
}
