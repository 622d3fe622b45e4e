//! Control plane assembly.
//!
//! In `run` mode the daemon:
//! 1. Loads and validates `arena.toml` and the game catalog
//! 2. Opens the state store and syncs the declared nodes into the ledger
//! 3. Starts the reconciler, watcher and failure detector loops
//! 4. Serves the HTTP API until ctrl-c, then stops the loops

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arena_allocator::Allocator;
use arena_api::{ApiState, build_router};
use arena_core::{DaemonConfig, DaemonSettings};
use arena_detector::Detector;
use arena_orchestrator::{MemoryOrchestrator, Orchestrator};
use arena_reconciler::{CatalogSource, FileCatalog, Reconciler, ReconcilerConfig, SupervisorEnv};
use arena_state::{NodeCapacity, StateStore, StatusHub};
use arena_watcher::Watcher;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Ledger entries for every `[[nodes]]` entry.
pub fn node_capacities(config: &DaemonConfig) -> anyhow::Result<Vec<NodeCapacity>> {
    config
        .nodes
        .iter()
        .map(|node| {
            Ok(NodeCapacity {
                name: node.name.clone(),
                ip: node.ip.clone(),
                capacity: node.capacity()?,
                port_range_start: node.port_range[0],
                port_range_end: node.port_range[1],
            })
        })
        .collect()
}

fn load(config_path: &Path) -> anyhow::Result<(DaemonConfig, DaemonSettings)> {
    let config = DaemonConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let settings = config.settings().context("invalid daemon configuration")?;
    let catalog = FileCatalog::new(&config.catalog)
        .load()
        .with_context(|| format!("failed to load catalog {}", config.catalog.display()))?;
    info!(
        games = catalog.games.len(),
        nodes = config.nodes.len(),
        "configuration loaded"
    );
    Ok((config, settings))
}

/// Validate configuration and catalog without starting anything.
pub fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let (config, settings) = load(config_path)?;
    for node in node_capacities(&config)? {
        info!(
            node = %node.name,
            ip = %node.ip,
            cpu_millis = node.capacity.cpu_millis,
            memory_bytes = node.capacity.memory_bytes,
            ports = node.port_count(),
            "node"
        );
    }
    info!(
        api_port = settings.api_port,
        reconcile_interval_secs = settings.reconcile_interval.as_secs(),
        detector_interval_secs = settings.detector_interval.as_secs(),
        "configuration is valid"
    );
    Ok(())
}

/// Run the control plane until ctrl-c.
pub async fn run_control_plane(
    config_path: &Path,
    data_dir: PathBuf,
    port_override: Option<u16>,
) -> anyhow::Result<()> {
    info!("Arena daemon starting");
    let (config, settings) = load(config_path)?;
    let nodes = node_capacities(&config)?;

    // ── State store + ledger ─────────────────────────────────────
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let db_path = data_dir.join("arena.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let allocator = Allocator::new(store.clone());
    allocator.sync_nodes(&nodes)?;
    info!(nodes = nodes.len(), "node ledger synced");

    // ── Orchestrator ─────────────────────────────────────────────
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(MemoryOrchestrator::auto());
    warn!(
        namespace = %settings.namespace,
        "using the in-memory orchestrator backend; workload objects are simulated"
    );

    let hub = StatusHub::default();
    let catalog: Arc<dyn CatalogSource> = Arc::new(FileCatalog::new(&config.catalog));

    // ── Control loops ────────────────────────────────────────────
    let reconciler = Reconciler::new(
        store.clone(),
        allocator.clone(),
        Arc::clone(&orchestrator),
        catalog,
    )
    .with_config(ReconcilerConfig {
        startup_timeout: settings.startup_timeout,
        stop_escalation_after: settings.stop_escalation_after,
        supervisor: SupervisorEnv {
            api_url: settings.internal_api_url.clone(),
            auth_token: settings.internal_token.clone(),
            ..SupervisorEnv::default()
        },
        ..ReconcilerConfig::default()
    })
    .with_hub(hub.clone());
    let watcher = Watcher::new(store.clone(), Arc::clone(&orchestrator)).with_hub(hub.clone());
    let detector = Detector::new(store.clone(), Arc::clone(&orchestrator))
        .with_crash_loop_threshold(settings.crash_loop_threshold)
        .with_hub(hub);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_interval = settings.reconcile_interval;
    let reconciler_shutdown = shutdown_rx.clone();
    let reconciler_handle = tokio::spawn(async move {
        reconciler.run(reconcile_interval, reconciler_shutdown).await;
    });

    let watcher_shutdown = shutdown_rx.clone();
    let watcher_handle = tokio::spawn(async move {
        watcher.run(watcher_shutdown).await;
    });

    let detector_interval = settings.detector_interval;
    let detector_shutdown = shutdown_rx;
    let detector_handle = tokio::spawn(async move {
        detector.run(detector_interval, detector_shutdown).await;
    });

    // ── API server ───────────────────────────────────────────────
    let router = build_router(ApiState::new(store, allocator, &settings.internal_token));
    let addr = SocketAddr::from(([0, 0, 0, 0], port_override.unwrap_or(settings.api_port)));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "API server listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    // Let in-flight passes finish.
    let _ = reconciler_handle.await;
    let _ = watcher_handle.await;
    let _ = detector_handle.await;

    info!("Arena daemon stopped");
    Ok(())
}
