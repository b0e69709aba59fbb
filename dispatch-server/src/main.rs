use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use dispatch_server::alerts::{AlertStore, SqliteAlertStore};
use dispatch_server::config::BrokerKind;
use dispatch_server::dispatch::{
    spawn_stats_logger, spawn_workers, system_alert_channel, RegistryEvent, SystemAlertLog,
};
use dispatch_server::logging::init_tracing;
use dispatch_server::publish::{AlertPublisher, NoopPublisher, WebSocketPublisher};
use dispatch_server::store::{LocalObjectStore, ObjectStore, UrlSigner};
use dispatch_server::{
    routes, AlgorithmRegistry, AppState, Config, DispatchHandles, InferenceQueue, PerformanceMonitor,
    Pipeline, Producer, Scheduler,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::args().any(|a| a == "--version" || a == "-V") {
        println!("frame-dispatch {}", VERSION);
        return Ok(());
    }

    let config = Config::load().map_err(|e| format!("Failed to load configuration: {}", e))?;
    init_tracing(&config.logging.level);
    tracing::info!("Starting frame-dispatch {}", VERSION);

    let cancel = CancellationToken::new();

    // Registry first so services can register while the rest comes up
    let registry = Arc::new(AlgorithmRegistry::new(config.registry.heartbeat_timeout()));
    registry
        .clone()
        .spawn_heartbeat_checker(config.registry.sweep_interval(), cancel.clone());
    spawn_registry_event_logger(&registry, cancel.clone());

    let signer = UrlSigner::new(config.store.signing_secret.clone());
    let objects = Arc::new(LocalObjectStore::new(
        &config.store.root,
        &config.store.public_base_url,
        signer,
        Duration::from_millis(config.store.poll_interval_ms),
    )?);
    let store: Arc<dyn ObjectStore> = objects.clone();

    let state = Arc::new(AppState::new(config.clone(), registry.clone()).with_objects(objects));

    // System alerts
    let alerts_tx = system_alert_channel();
    let system_alerts = Arc::new(SystemAlertLog::new());
    system_alerts
        .clone()
        .spawn_collector(alerts_tx.subscribe(), cancel.clone());

    let alert_store: Arc<dyn AlertStore> = Arc::new(SqliteAlertStore::new(&config.alerts.database_url)?);

    let publisher: Arc<dyn AlertPublisher> = match (config.broker.kind, &config.broker.url) {
        (BrokerKind::Websocket, Some(url)) => {
            let (publisher, _) = WebSocketPublisher::spawn(
                url.clone(),
                config.broker.buffer,
                Duration::from_secs(config.broker.reconnect_delay_secs),
                cancel.clone(),
            );
            Arc::new(publisher)
        }
        _ => {
            tracing::info!("No alert broker configured");
            Arc::new(NoopPublisher)
        }
    };

    let mut queue = InferenceQueue::new(config.queue.capacity, config.queue.strategy)
        .with_alert_interval(Duration::from_secs(config.queue.alert_interval_secs))
        .with_alerts(alerts_tx.clone());
    if let Some(threshold) = config.queue.alert_threshold {
        queue = queue.with_alert_threshold(threshold);
    }
    if config.queue.delete_evicted {
        queue = queue.with_eviction_delete(store.clone());
    }
    let queue = Arc::new(queue);

    let monitor = Arc::new(
        PerformanceMonitor::new(config.monitor.slow_threshold_ms).with_alerts(alerts_tx.clone()),
    );

    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        monitor.clone(),
        store.clone(),
        alert_store.clone(),
        publisher,
        config.scheduler.options(&config.producer.alert_base_path),
    )?);

    let pipeline = Arc::new(Pipeline::new(queue.clone(), monitor, scheduler));
    spawn_workers(pipeline.clone(), config.scheduler.worker_count(), cancel.clone());
    spawn_stats_logger(
        pipeline.clone(),
        Duration::from_secs(config.monitor.stats_log_interval_secs),
        config.monitor.high_drop_rate,
        alerts_tx,
        cancel.clone(),
    );

    let producer = Arc::new(Producer::new(&config.producer, store, queue));
    let producer_task = producer.spawn(cancel.clone())?;
    tokio::spawn(async move {
        match producer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Producer halted: {}. Restart the service to resume intake", e),
            Err(e) => tracing::error!("Producer task failed: {}", e),
        }
    });
    tracing::info!("Producer started in {:?} mode", config.producer.mode);

    state.install(DispatchHandles {
        pipeline,
        alert_store,
        system_alerts,
        producer,
    });

    let app = routes::app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn spawn_registry_event_logger(registry: &AlgorithmRegistry, cancel: CancellationToken) {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(RegistryEvent::Registered { service_id, endpoint, task_types }) => {
                        tracing::info!("Algorithm {} registered at {} for {:?}", service_id, endpoint, task_types);
                    }
                    Ok(RegistryEvent::Unregistered { service_id, endpoint, reason }) => {
                        tracing::info!("Algorithm {} at {} unregistered ({})", service_id, endpoint, reason.as_str());
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Registry event logger skipped {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}
