//! Background loops draining the queue and reporting pipeline health.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::system_alert::{AlertLevel, SystemAlert, SystemAlertKind, SystemAlertSender};
use super::Pipeline;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn `count` workers that pop the queue and schedule each image.
pub fn spawn_workers(pipeline: Arc<Pipeline>, count: usize, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    tracing::info!("Starting {} dispatch workers", count);
    (0..count)
        .map(|worker_id| {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_worker(worker_id, pipeline, cancel).await })
        })
        .collect()
}

async fn run_worker(worker_id: usize, pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    let notify = pipeline.queue.notifier();

    loop {
        // Drain whatever is queued before waiting again
        while let Some(image) = pipeline.queue.pop().await {
            let summary = pipeline.scheduler.schedule_inference(&image).await;
            tracing::debug!(
                "Worker {} finished {}: {}/{} succeeded",
                worker_id,
                image.path,
                summary.succeeded,
                summary.attempted
            );
            if cancel.is_cancelled() {
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = notify.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }

    tracing::debug!("Worker {} stopped", worker_id);
}

/// Periodically log pipeline stats and raise an alert when too much is dropped.
pub fn spawn_stats_logger(
    pipeline: Arc<Pipeline>,
    interval: Duration,
    high_drop_rate: f64,
    alerts: SystemAlertSender,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let stats = pipeline.stats().await;
            tracing::info!(
                "Queue {}/{} (dropped {}, processed {}), inferences {} ok / {} failed, avg {:.0}ms, {:.1}/min",
                stats.queue.queue_size,
                stats.queue.max_size,
                stats.queue.dropped_total,
                stats.queue.processed_total,
                stats.performance.success_count,
                stats.performance.failed_count,
                stats.performance.avg_inference_ms,
                stats.performance.inferences_per_min
            );

            if stats.drop_rate > high_drop_rate {
                let _ = alerts.send(SystemAlert::new(
                    SystemAlertKind::HighDropRate,
                    AlertLevel::Error,
                    format!(
                        "Drop rate {:.1}% exceeds {:.1}%",
                        stats.drop_rate * 100.0,
                        high_drop_rate * 100.0
                    ),
                    json!({
                        "drop_rate": stats.drop_rate,
                        "threshold": high_drop_rate,
                        "dropped_total": stats.queue.dropped_total,
                        "processed_total": stats.queue.processed_total,
                    }),
                ));
            }
        }
    })
}
