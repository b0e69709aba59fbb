//! Producers discover new frames in the object store and feed the queue.
//!
//! Two strategies share the same intake contract: a periodic [`scanner`]
//! that lists the store, and an event-driven [`listener`] that follows its
//! change notifications. Both run as one supervised task per producer; a
//! panic halts the loop and is reported through [`ProducerStatus`].

mod listener;
mod scanner;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ProducerConfig, ProducerMode};
use crate::dispatch::{InferenceQueue, PendingImage};
use crate::store::{ObjectInfo, ObjectStore};

const IMAGE_SUFFIXES: [&str; 3] = [".jpg", ".jpeg", ".png"];
const PREVIEW_PREFIX: &str = "preview_";

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("Producer is already running")]
    AlreadyRunning,
    #[error("Producer panicked: {0}")]
    Panicked(String),
}

/// Lifecycle of a producer loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ProducerStatus {
    Stopped,
    Listening,
    Reconnecting,
    /// The loop panicked and will not restart on its own.
    Halted(String),
}

impl ProducerStatus {
    pub fn is_healthy(&self) -> bool {
        !matches!(self, ProducerStatus::Halted(_))
    }
}

/// Where discovered images go.
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Returns how many images were accepted.
    async fn submit(&self, images: Vec<PendingImage>) -> usize;

    /// Forget an image that disappeared from the store.
    async fn withdraw(&self, path: &str) -> bool;
}

#[async_trait]
impl ImageSink for InferenceQueue {
    async fn submit(&self, images: Vec<PendingImage>) -> usize {
        self.add(images).await
    }

    async fn withdraw(&self, path: &str) -> bool {
        self.remove(path).await
    }
}

/// Decides which object keys are frames to analyse and parses them.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    base_path: String,
    alert_base_path: String,
}

impl KeyFilter {
    pub fn new(base_path: &str, alert_base_path: &str) -> Self {
        Self {
            base_path: base_path.trim_matches('/').to_string(),
            alert_base_path: alert_base_path.trim_matches('/').to_string(),
        }
    }

    /// Listing/subscription prefix covering every frame.
    pub fn prefix(&self) -> String {
        if self.base_path.is_empty() {
            String::new()
        } else {
            format!("{}/", self.base_path)
        }
    }

    /// Parse `<base>/<task_type>/<task_id>/.../<filename>` into its parts,
    /// or `None` when the key is not a frame to analyse.
    pub fn parse<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
        if !self.alert_base_path.is_empty()
            && key.starts_with(&format!("{}/", self.alert_base_path))
        {
            return None;
        }

        let lower = key.to_ascii_lowercase();
        if !IMAGE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
            return None;
        }
        // Hidden files and markers such as .keep
        if key.contains("/.") || key.starts_with('.') {
            return None;
        }

        let filename = key.rsplit('/').next().unwrap_or(key);
        if filename.starts_with(PREVIEW_PREFIX) {
            return None;
        }

        let relative = key.strip_prefix(&self.prefix()).unwrap_or(key);
        let parts: Vec<&str> = relative.split('/').collect();
        if parts.len() < 3 || parts[0].is_empty() || parts[1].is_empty() {
            return None;
        }
        Some((parts[0], parts[1], filename))
    }

    pub fn pending_image(&self, info: &ObjectInfo) -> Option<PendingImage> {
        let (task_type, task_id, filename) = self.parse(&info.key)?;
        Some(PendingImage {
            path: info.key.clone(),
            task_type: task_type.to_string(),
            task_id: task_id.to_string(),
            filename: filename.to_string(),
            size: info.size,
            modified_at: info.last_modified,
        })
    }
}

/// Paths handed to the queue recently, with TTL pruning.
#[derive(Debug)]
pub struct ProcessedSet {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    prune_threshold: usize,
}

impl ProcessedSet {
    pub fn new(ttl: Duration, prune_threshold: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            prune_threshold,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries().contains_key(path)
    }

    pub fn insert(&self, path: &str) {
        let mut entries = self.entries();
        entries.insert(path.to_string(), Instant::now());
        if entries.len() > self.prune_threshold {
            Self::prune_locked(&mut entries, self.ttl);
        }
    }

    pub fn remove(&self, path: &str) -> bool {
        self.entries().remove(path).is_some()
    }

    /// Drop entries older than the TTL, returning how many were removed.
    pub fn prune(&self) -> usize {
        Self::prune_locked(&mut self.entries(), self.ttl)
    }

    fn prune_locked(entries: &mut HashMap<String, Instant>, ttl: Duration) -> usize {
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, at| now.duration_since(*at) <= ttl);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!("Pruned {} processed entries, {} remaining", removed, entries.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// A scanner or listener bound to one store and one sink.
pub struct Producer {
    mode: ProducerMode,
    store: Arc<dyn ObjectStore>,
    sink: Arc<dyn ImageSink>,
    filter: KeyFilter,
    processed: ProcessedSet,
    scan_interval: Duration,
    reconnect_delay: Duration,
    status: watch::Sender<ProducerStatus>,
    running: AtomicBool,
}

impl Producer {
    pub fn new(config: &ProducerConfig, store: Arc<dyn ObjectStore>, sink: Arc<dyn ImageSink>) -> Self {
        let (status, _) = watch::channel(ProducerStatus::Stopped);
        Self {
            mode: config.mode,
            store,
            sink,
            filter: KeyFilter::new(&config.base_path, &config.alert_base_path),
            processed: ProcessedSet::new(config.processed_ttl(), config.prune_threshold),
            scan_interval: config.scan_interval(),
            reconnect_delay: config.reconnect_delay(),
            status,
            running: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> ProducerMode {
        self.mode
    }

    pub fn status(&self) -> ProducerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ProducerStatus> {
        self.status.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.status.borrow().is_healthy()
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    fn set_status(&self, status: ProducerStatus) {
        let previous = self.status.send_replace(status.clone());
        if previous != status {
            tracing::info!("Producer state {:?} -> {:?}", previous, status);
        }
    }

    /// Start the loop as a supervised task.
    ///
    /// Only one loop may run per producer. The task ends with
    /// [`ProducerError::Panicked`] if the loop panics; it is not restarted.
    pub fn spawn(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<(), ProducerError>>, ProducerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProducerError::AlreadyRunning);
        }

        let producer = self.clone();
        Ok(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(producer.run(cancel)).catch_unwind().await;
            let result = match outcome {
                Ok(()) => {
                    producer.set_status(ProducerStatus::Stopped);
                    Ok(())
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(mode = ?producer.mode, "Producer loop panicked, halting: {}", reason);
                    producer.set_status(ProducerStatus::Halted(reason.clone()));
                    Err(ProducerError::Panicked(reason))
                }
            };
            producer.running.store(false, Ordering::SeqCst);
            result
        }))
    }

    async fn run(&self, cancel: CancellationToken) {
        match self.mode {
            ProducerMode::Scan => scanner::run(self, cancel).await,
            ProducerMode::Listen => listener::run(self, cancel).await,
        }
    }

    /// Sleep for the reconnect delay. Returns false if cancelled meanwhile.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EvictionStrategy;
    use crate::store::MemoryObjectStore;
    use rstest::rstest;

    #[rstest]
    #[case("frames/helmet/cam-1/a.jpg", Some(("helmet", "cam-1", "a.jpg")))]
    #[case("frames/helmet/cam-1/A.JPEG", Some(("helmet", "cam-1", "A.JPEG")))]
    #[case("frames/helmet/cam-1/sub/b.png", Some(("helmet", "cam-1", "b.png")))]
    #[case("frames/helmet/a.jpg", None)]
    #[case("frames/helmet/cam-1/a.txt", None)]
    #[case("frames/helmet/cam-1/.keep.jpg", None)]
    #[case("frames/helmet/cam-1/algo_config.json", None)]
    #[case("frames/helmet/cam-1/preview_a.jpg", None)]
    #[case("alerts/helmet/cam-1/a.jpg", None)]
    fn test_key_filter(#[case] key: &str, #[case] expected: Option<(&str, &str, &str)>) {
        let filter = KeyFilter::new("frames/", "alerts");
        assert_eq!(filter.parse(key), expected);
    }

    #[rstest]
    #[case("alerts/helmet/a.jpg", None)]
    #[case("alerts2/cam-1/a.jpg", Some(("alerts2", "cam-1", "a.jpg")))]
    #[case("alerts-old/cam-1/a.jpg", Some(("alerts-old", "cam-1", "a.jpg")))]
    fn test_alert_prefix_matches_whole_segment(
        #[case] key: &str,
        #[case] expected: Option<(&str, &str, &str)>,
    ) {
        let filter = KeyFilter::new("", "alerts/");
        assert_eq!(filter.parse(key), expected);
    }

    #[test]
    fn test_key_filter_without_base() {
        let filter = KeyFilter::new("", "");
        assert_eq!(filter.prefix(), "");
        assert_eq!(filter.parse("helmet/cam-1/a.jpg"), Some(("helmet", "cam-1", "a.jpg")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_set_prunes_expired() {
        let set = ProcessedSet::new(Duration::from_secs(60), 2);
        set.insert("a");
        set.insert("b");
        tokio::time::advance(Duration::from_secs(61)).await;
        set.insert("c");

        assert!(!set.contains("a"));
        assert!(set.contains("c"));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_set_keeps_fresh_entries_below_threshold() {
        let set = ProcessedSet::new(Duration::from_secs(60), 100);
        set.insert("a");
        tokio::time::advance(Duration::from_secs(120)).await;
        set.insert("b");
        assert_eq!(set.len(), 2);
        assert_eq!(set.prune(), 1);
        assert!(set.remove("b"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_halted_is_unhealthy() {
        assert!(ProducerStatus::Stopped.is_healthy());
        assert!(ProducerStatus::Reconnecting.is_healthy());
        assert!(!ProducerStatus::Halted("boom".to_string()).is_healthy());
    }

    struct PanickingSink;

    #[async_trait]
    impl ImageSink for PanickingSink {
        async fn submit(&self, _images: Vec<PendingImage>) -> usize {
            panic!("sink exploded");
        }

        async fn withdraw(&self, _path: &str) -> bool {
            false
        }
    }

    fn config(mode: ProducerMode) -> ProducerConfig {
        ProducerConfig {
            mode,
            scan_interval_ms: 100,
            reconnect_delay_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_panic_halts_producer() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put("frames/helmet/cam-1/a.jpg", vec![1]).await;
        let producer = Arc::new(Producer::new(
            &config(ProducerMode::Scan),
            store,
            Arc::new(PanickingSink),
        ));

        let handle = producer.spawn(CancellationToken::new()).unwrap();
        let result = handle.await.unwrap();

        assert!(matches!(result, Err(ProducerError::Panicked(reason)) if reason == "sink exploded"));
        assert_eq!(producer.status(), ProducerStatus::Halted("sink exploded".to_string()));
        assert!(!producer.is_healthy());
    }

    #[tokio::test]
    async fn test_second_spawn_is_rejected() {
        let store = Arc::new(MemoryObjectStore::new());
        let queue = Arc::new(InferenceQueue::new(10, EvictionStrategy::DropOldest));
        let producer = Arc::new(Producer::new(&config(ProducerMode::Listen), store, queue));

        let cancel = CancellationToken::new();
        let handle = producer.spawn(cancel.clone()).unwrap();
        assert!(matches!(
            producer.spawn(cancel.clone()),
            Err(ProducerError::AlreadyRunning)
        ));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(producer.status(), ProducerStatus::Stopped);
    }
}
