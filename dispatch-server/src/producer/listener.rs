//! Event-driven producer following the store's change notifications.

use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{Producer, ProducerStatus};
use crate::store::{ObjectEvent, ObjectInfo};

const PRUNE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub(super) async fn run(producer: &Producer, cancel: CancellationToken) {
    let prefix = producer.filter.prefix();
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    prune.tick().await;

    loop {
        tracing::info!("Subscribing to {} prefix '{}'", producer.store.name(), prefix);
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => break,
            subscribed = producer.store.subscribe(&prefix) => subscribed,
        };

        let mut events = match subscribed {
            Ok(events) => events,
            Err(e) => {
                tracing::error!("Failed to subscribe to store notifications: {}", e);
                producer.set_status(ProducerStatus::Reconnecting);
                if !producer.backoff(&cancel).await {
                    break;
                }
                continue;
            }
        };
        producer.set_status(ProducerStatus::Listening);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Listener stopped");
                    return;
                }
                _ = prune.tick() => {
                    producer.processed.prune();
                }
                event = events.next() => match event {
                    Some(Ok(ObjectEvent::Created(info))) => on_created(producer, info).await,
                    Some(Ok(ObjectEvent::Removed { key })) => on_removed(producer, &key).await,
                    Some(Err(e)) => {
                        tracing::warn!("Notification stream error: {}", e);
                        break;
                    }
                    None => {
                        tracing::warn!("Notification stream closed");
                        break;
                    }
                },
            }
        }

        drop(events);
        producer.set_status(ProducerStatus::Reconnecting);
        tracing::info!("Reconnecting in {:?}", producer.reconnect_delay);
        if !producer.backoff(&cancel).await {
            break;
        }
    }

    tracing::info!("Listener stopped");
}

async fn on_created(producer: &Producer, info: ObjectInfo) {
    let Some(image) = producer.filter.pending_image(&info) else {
        tracing::trace!("Ignoring {}", info.key);
        return;
    };
    if producer.processed.contains(&image.path) {
        tracing::debug!("Already processed {}, skipping", image.path);
        return;
    }

    tracing::info!(
        "New image {} (task_type={}, task_id={}, {} bytes)",
        image.path,
        image.task_type,
        image.task_id,
        image.size
    );
    producer.processed.insert(&image.path);
    producer.sink.submit(vec![image]).await;
}

async fn on_removed(producer: &Producer, key: &str) {
    producer.processed.remove(key);
    if producer.sink.withdraw(key).await {
        tracing::info!("Image {} deleted, removed from queue", key);
    } else {
        tracing::debug!("Image {} deleted", key);
    }
}
