//! keeld — the Keel daemon.
//!
//! Single binary that assembles all Keel subsystems:
//! - State store (redb) + in-memory registry
//! - Health checker (HTTP probes)
//! - Circuit breakers + request router
//! - Deployment orchestrator
//! - Reconciliation loop (re-probe, auto-scaling, metrics)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! keeld standalone --port 8443 --data-dir /var/lib/keel --config /etc/keel/keel.toml
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use keel_balancer::{CircuitBreakers, Router};
use keel_health::{HealthChecker, HttpProbe};
use keel_metrics::MetricsCollector;
use keel_reconcile::Reconciler;
use keel_rollout::Orchestrator;
use keel_state::{Registry, StateStore};

use crate::config::KeelConfig;

#[derive(Parser)]
#[command(name = "keeld", about = "Keel deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (all subsystems in one process).
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/keel")]
        data_dir: PathBuf,

        /// Reconciliation interval in seconds (overrides the config file).
        #[arg(long)]
        reconcile_interval: Option<u64>,

        /// Path to keel.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keeld=debug,keel=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            reconcile_interval,
            config,
        } => {
            let mut config = KeelConfig::load(config.as_deref())?;
            if let Some(secs) = reconcile_interval {
                config.reconcile.interval_secs = secs;
            }
            run_standalone(port, data_dir, config).await
        }
    }
}

async fn run_standalone(port: u16, data_dir: PathBuf, config: KeelConfig) -> anyhow::Result<()> {
    info!("Keel daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("keel.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let registry = Registry::load(store)?;
    config.register_endpoints(&registry)?;
    let orphaned = registry.deployments().iter().filter(|d| !d.is_terminal()).count();
    if orphaned > 0 {
        warn!(count = orphaned, "deployments left unfinished by a previous run; cancel them to close them out");
    }
    info!(
        endpoints = registry.endpoints().len(),
        instances = registry.instances().len(),
        "registry loaded"
    );

    let checker = Arc::new(HealthChecker::new(Arc::new(HttpProbe), config.health.clone()));
    let breakers = Arc::new(CircuitBreakers::new(config.circuit_breaker.clone()));
    let orchestrator = Orchestrator::new(registry.clone(), checker).with_breakers(breakers.clone());
    let router = Router::new(registry.clone(), breakers.clone());
    let metrics = Arc::new(MetricsCollector::new(registry).with_breakers(breakers.clone()));

    let reconciler = Reconciler::new(orchestrator.clone(), metrics.clone(), config.reconcile.clone())
        .with_breakers(breakers);
    info!(interval = config.reconcile.interval_secs, "reconciler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let app = keel_api::build_router(keel_api::ApiState {
        orchestrator,
        router,
        metrics,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = reconcile_handle.await;

    info!("Keel daemon stopped");
    Ok(())
}
