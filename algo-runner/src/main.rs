//! Algorithm runner binary.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use algo_runner::logging::init_tracing;
use algo_runner::{api, AppState, Config, ControlPlaneClient, ProbeDetector, StatsTracker};
use dispatch_common::ServiceRegistration;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::args().any(|a| a == "--version" || a == "-V") {
        println!("algo-runner {}", VERSION);
        return Ok(());
    }

    init_tracing("info");

    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure config.toml exists or set RUNNER__SERVICE__ID and RUNNER__SERVICE__TASK_TYPES.",
            e
        )
    })?;
    tracing::info!(
        "Starting algo-runner: {} ({}) for {:?}",
        config.service_name(),
        config.service.id,
        config.service.task_types
    );

    let cancel = CancellationToken::new();
    let stats = Arc::new(StatsTracker::new());
    let state = Arc::new(AppState::new(config.clone(), Arc::new(ProbeDetector), stats.clone())?);

    if let Some(control) = &config.control_plane {
        let registration = ServiceRegistration {
            service_id: config.service.id.clone(),
            name: config.service_name().to_string(),
            task_types: config.service.task_types.clone(),
            endpoint: config.endpoint(),
            version: config.service.version.clone(),
        };
        let client = ControlPlaneClient::new(
            &control.base_url,
            registration,
            stats,
            Duration::from_secs(control.heartbeat_interval_secs),
            Duration::from_secs(control.retry_delay_secs),
        )?;
        let token = cancel.clone();
        tokio::spawn(async move { client.run(token).await });
        tracing::info!("Control plane client started, dispatcher at {}", control.base_url);
    } else {
        tracing::info!("No control plane configured, running in standalone mode");
    }

    let app = api::app(state);

    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
