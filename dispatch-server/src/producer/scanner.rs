//! Periodic full listing of the object store.

use tokio_util::sync::CancellationToken;

use super::{Producer, ProducerStatus};
use crate::store::StoreError;

pub(super) async fn run(producer: &Producer, cancel: CancellationToken) {
    let prefix = producer.filter.prefix();
    tracing::info!(
        "Scanner started on {} prefix '{}', interval {:?}",
        producer.store.name(),
        prefix,
        producer.scan_interval
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match scan_once(producer, &prefix).await {
            Ok(accepted) => {
                producer.set_status(ProducerStatus::Listening);
                if accepted > 0 {
                    tracing::info!("Scan queued {} new images", accepted);
                } else {
                    tracing::debug!("Scan found no new images");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(producer.scan_interval) => {}
                }
            }
            Err(e) => {
                tracing::error!("Scan of '{}' failed: {}", prefix, e);
                producer.set_status(ProducerStatus::Reconnecting);
                if !producer.backoff(&cancel).await {
                    break;
                }
            }
        }
    }

    tracing::info!("Scanner stopped");
}

/// List once and submit every unseen frame. Returns how many the sink accepted.
async fn scan_once(producer: &Producer, prefix: &str) -> Result<usize, StoreError> {
    let objects = producer.store.list(prefix).await?;
    let total = objects.len();

    let mut images = vec![];
    for info in &objects {
        if producer.processed.contains(&info.key) {
            continue;
        }
        let Some(image) = producer.filter.pending_image(info) else {
            continue;
        };
        producer.processed.insert(&image.path);
        images.push(image);
    }

    tracing::debug!("Scanned {} objects, {} new", total, images.len());
    if images.is_empty() {
        return Ok(0);
    }
    Ok(producer.sink.submit(images).await)
}
