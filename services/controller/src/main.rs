//! vmctl controller
//!
//! Runs the RunPolicy reconciler, the instance handler and the migration
//! coordinator against an in-memory object store, and serves the REST API.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmctl_controller::{
    actions::Actions,
    api,
    cluster::Cluster,
    config,
    runtime::{InstanceRuntime, SimulatedRuntime},
    state::AppState,
    worker::spawn_control_loops,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to VMCTL_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmctl controller");
    info!(
        listen_addr = %config.listen_addr,
        nodes = ?config.nodes,
        interval_ms = config.loops.interval.as_millis() as u64,
        "Configuration loaded"
    );

    if !config.dev_mode {
        error!("No hypervisor runtime is available; set VMCTL_DEV=1 to use the simulated runtime");
        anyhow::bail!("VMCTL_DEV is required");
    }

    let cluster = Arc::new(Cluster::new(config.nodes.iter().cloned()));
    let runtime: Arc<dyn InstanceRuntime> = Arc::new(SimulatedRuntime::new());
    info!("Using simulated runtime (dev mode)");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_handles = spawn_control_loops(
        cluster.clone(),
        runtime.clone(),
        &config.loops,
        shutdown_rx.clone(),
    );

    let state = AppState::new(Actions::new(cluster, runtime));
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for control loops to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    for handle in loop_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Control loop did not shut down in time");
        }
    }

    info!("Controller shutdown complete");
    Ok(())
}
