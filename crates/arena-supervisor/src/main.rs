//! arena-supervisor: runs one game server inside its container.
//!
//! All configuration comes from `ARENA_*` environment variables injected
//! by the control plane. The process exits non-zero if the game server
//! fails to start or crashes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use arena_supervisor::{
    HttpReporter, ProcessState, REPORT_DEADLINE, StartOutcome, Supervisor, SupervisorConfig,
    server,
};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,arena_supervisor=debug")),
        )
        .init();

    let config = SupervisorConfig::from_env().context("invalid supervisor configuration")?;
    info!(
        server_id = %config.server_id,
        api_url = %config.api_url,
        health = config.health.kind.as_str(),
        "arena-supervisor starting"
    );

    let reporter = Arc::new(HttpReporter::new(&config));
    let health_port = config.health_server_port;
    let supervisor = Supervisor::new(config, reporter);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr = SocketAddr::from(([0, 0, 0, 0], health_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health server on {addr}"))?;
    info!(%addr, "health server listening");
    let app = server::router(Arc::clone(&supervisor));
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "health server failed");
        }
    });

    // SIGTERM during startup must still stop gracefully.
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let outcome = supervisor
        .start_or_interrupt(shutdown_signal(&mut terminate))
        .await;
    let final_state = match outcome {
        StartOutcome::Interrupted => {
            info!("termination signal received during startup");
            supervisor.state()
        }
        StartOutcome::Failed(e) => {
            flush_final_report(&supervisor).await;
            let _ = shutdown_tx.send(true);
            let _ = server.await;
            return Err(e).context("game server failed to start");
        }
        StartOutcome::Started => {
            tokio::spawn(
                Arc::clone(&supervisor)
                    .run_health_monitor(supervisor.unhealthy_reporter(), shutdown_rx.clone()),
            );
            tokio::spawn(Arc::clone(&supervisor).run_heartbeat(shutdown_rx.clone()));

            tokio::select! {
                _ = shutdown_signal(&mut terminate) => {
                    info!("termination signal received, stopping game server");
                    stop_gracefully(&supervisor).await
                }
                state = supervisor.wait_final() => state,
            }
        }
    };

    flush_final_report(&supervisor).await;
    let _ = shutdown_tx.send(true);
    let _ = server.await;
    info!(state = %final_state, "arena-supervisor exiting");

    if final_state == ProcessState::Failed {
        anyhow::bail!("game server failed");
    }
    Ok(())
}

async fn stop_gracefully(supervisor: &Supervisor) -> ProcessState {
    if let Err(e) = supervisor.stop(true).await {
        warn!(error = %e, "graceful stop failed");
    }
    supervisor.state()
}

/// Give queued reports, the final one included, up to one report deadline.
async fn flush_final_report(supervisor: &Supervisor) {
    if !supervisor.flush_reports(REPORT_DEADLINE).await {
        warn!("final status report not confirmed before deadline");
    }
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal(terminate: &mut Signal) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
