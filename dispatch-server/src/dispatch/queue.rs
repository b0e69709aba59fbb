//! Bounded intake queue between producers and the scheduler.
//!
//! When full, the configured [`EvictionStrategy`] decides what is discarded.
//! Evicted images can have their backing object deleted in a detached task.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::pending::PendingImage;
use super::system_alert::{AlertLevel, SystemAlert, SystemAlertKind, SystemAlertSender};
use crate::store::ObjectStore;

const EVICTED_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// What to discard when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Evict the front element to make room.
    #[default]
    DropOldest,
    /// Reject the incoming image.
    DropNewest,
    /// Replace the whole queue with the newest images of the batch.
    LatestOnly,
}

impl EvictionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionStrategy::DropOldest => "drop_oldest",
            EvictionStrategy::DropNewest => "drop_newest",
            EvictionStrategy::LatestOnly => "latest_only",
        }
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `dropped / (dropped + processed)`, zero when nothing was seen yet.
pub fn drop_rate(dropped: u64, processed: u64) -> f64 {
    let total = dropped + processed;
    if total == 0 {
        0.0
    } else {
        dropped as f64 / total as f64
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub max_size: usize,
    pub dropped_total: u64,
    pub processed_total: u64,
    pub utilization: f64,
    pub strategy: EvictionStrategy,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<PendingImage>,
    /// Paths currently queued, for de-duplication.
    queued: HashSet<String>,
    dropped: u64,
    processed: u64,
    last_alert: Option<Instant>,
}

impl QueueState {
    fn push(&mut self, image: PendingImage) {
        self.queued.insert(image.path.clone());
        self.items.push_back(image);
    }

    fn pop(&mut self) -> Option<PendingImage> {
        let image = self.items.pop_front()?;
        self.queued.remove(&image.path);
        Some(image)
    }
}

/// Bounded FIFO of images waiting for dispatch.
pub struct InferenceQueue {
    capacity: usize,
    strategy: EvictionStrategy,
    alert_threshold: usize,
    alert_interval: Duration,
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
    /// Deletes the backing object of evicted images when set.
    object_store: Option<Arc<dyn ObjectStore>>,
    alerts: Option<SystemAlertSender>,
}

impl InferenceQueue {
    /// Create a queue holding at most `capacity` images (minimum 1).
    pub fn new(capacity: usize, strategy: EvictionStrategy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            strategy,
            alert_threshold: capacity / 2,
            alert_interval: Duration::from_secs(60),
            state: Mutex::new(QueueState::default()),
            notify: Arc::new(Notify::new()),
            object_store: None,
            alerts: None,
        }
    }

    /// Occupancy above which backlog alerts fire.
    pub fn with_alert_threshold(mut self, threshold: usize) -> Self {
        self.alert_threshold = threshold;
        self
    }

    /// Minimum spacing between backlog alerts.
    pub fn with_alert_interval(mut self, interval: Duration) -> Self {
        self.alert_interval = interval;
        self
    }

    /// Delete evicted images from `store` in the background.
    pub fn with_eviction_delete(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn with_alerts(mut self, alerts: SystemAlertSender) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> EvictionStrategy {
        self.strategy
    }

    /// Notifier signalled whenever images are enqueued.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Enqueue images, applying the eviction strategy when full.
    ///
    /// Images whose path is already queued are skipped. Returns the number
    /// of images actually enqueued.
    pub async fn add(&self, images: Vec<PendingImage>) -> usize {
        let mut evicted = vec![];
        let (added, alert) = {
            let mut state = self.state.lock().await;

            let mut seen = HashSet::new();
            let mut incoming: Vec<PendingImage> = images
                .into_iter()
                .filter(|img| !state.queued.contains(&img.path) && seen.insert(img.path.clone()))
                .collect();
            let mut added = 0usize;

            match self.strategy {
                EvictionStrategy::DropOldest => {
                    for image in incoming {
                        if state.items.len() >= self.capacity {
                            if let Some(oldest) = state.pop() {
                                state.dropped += 1;
                                if seen.contains(&oldest.path) {
                                    added -= 1;
                                }
                                evicted.push(oldest);
                            }
                        }
                        state.push(image);
                        added += 1;
                    }
                }
                EvictionStrategy::DropNewest => {
                    for image in incoming {
                        if state.items.len() >= self.capacity {
                            state.dropped += 1;
                            evicted.push(image);
                        } else {
                            state.push(image);
                            added += 1;
                        }
                    }
                }
                EvictionStrategy::LatestOnly => {
                    if state.items.len() + incoming.len() > self.capacity {
                        let cleared = state.items.len() as u64;
                        evicted.extend(state.items.drain(..));
                        state.queued.clear();
                        state.dropped += cleared;

                        let excess = incoming.len().saturating_sub(self.capacity);
                        evicted.extend(incoming.drain(..excess));
                        state.dropped += excess as u64;
                    }
                    added = incoming.len();
                    for image in incoming {
                        state.push(image);
                    }
                }
            }

            let alert = self.check_backlog(&mut state);
            (added, alert)
        };

        if !evicted.is_empty() {
            tracing::debug!(
                "Queue evicted {} images ({})",
                evicted.len(),
                self.strategy
            );
            self.delete_evicted(evicted);
        }

        if let (Some(alert), Some(alerts)) = (alert, &self.alerts) {
            let _ = alerts.send(alert);
        }

        for _ in 0..added {
            self.notify.notify_one();
        }

        added
    }

    /// Remove the front image.
    pub async fn pop(&self) -> Option<PendingImage> {
        let mut state = self.state.lock().await;
        let image = state.pop()?;
        state.processed += 1;
        Some(image)
    }

    /// Remove up to `n` images from the front.
    pub async fn pop_batch(&self, n: usize) -> Vec<PendingImage> {
        let mut state = self.state.lock().await;
        let mut batch = Vec::with_capacity(n.min(state.items.len()));
        while batch.len() < n {
            match state.pop() {
                Some(image) => batch.push(image),
                None => break,
            }
        }
        state.processed += batch.len() as u64;
        batch
    }

    /// Drop a queued image whose object disappeared. Counters are untouched.
    pub async fn remove(&self, path: &str) -> bool {
        let mut state = self.state.lock().await;
        if !state.queued.remove(path) {
            return false;
        }
        state.items.retain(|img| img.path != path);
        true
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.state.lock().await.queued.contains(path)
    }

    /// Empty the queue without touching the counters. Returns the number cleared.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.items.len();
        state.items.clear();
        state.queued.clear();
        cleared
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    /// Paths currently queued, front first.
    pub async fn paths(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .items
            .iter()
            .map(|img| img.path.clone())
            .collect()
    }

    pub async fn drop_rate(&self) -> f64 {
        let state = self.state.lock().await;
        drop_rate(state.dropped, state.processed)
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queue_size: state.items.len(),
            max_size: self.capacity,
            dropped_total: state.dropped,
            processed_total: state.processed,
            utilization: state.items.len() as f64 / self.capacity as f64,
            strategy: self.strategy,
        }
    }

    fn check_backlog(&self, state: &mut QueueState) -> Option<SystemAlert> {
        let size = state.items.len();
        if size <= self.alert_threshold {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = state.last_alert {
            if now.duration_since(last) < self.alert_interval {
                return None;
            }
        }
        state.last_alert = Some(now);

        Some(SystemAlert::new(
            SystemAlertKind::QueueBacklog,
            AlertLevel::Warning,
            format!(
                "Inference queue backlog: {}/{} images, {} dropped so far",
                size, self.capacity, state.dropped
            ),
            json!({
                "queue_size": size,
                "max_size": self.capacity,
                "dropped": state.dropped,
            }),
        ))
    }

    fn delete_evicted(&self, evicted: Vec<PendingImage>) {
        let Some(store) = &self.object_store else {
            return;
        };

        for image in evicted {
            let store = store.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(EVICTED_DELETE_TIMEOUT, store.delete(&image.path)).await {
                    Ok(Ok(())) => tracing::debug!("Deleted evicted image {}", image.path),
                    Ok(Err(e)) => {
                        tracing::warn!("Failed to delete evicted image {}: {}", image.path, e)
                    }
                    Err(_) => tracing::warn!("Timed out deleting evicted image {}", image.path),
                }
            });
        }
    }
}
