//! Fans each pending image out to every algorithm registered for its task type.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;

use dispatch_common::{AlertRecord, InferenceRequest, InferenceResponse};

use super::monitor::PerformanceMonitor;
use super::pending::PendingImage;
use super::registry::{AlgorithmInstance, AlgorithmRegistry};
use crate::alerts::AlertStore;
use crate::publish::AlertPublisher;
use crate::store::{ObjectStore, StoreError};

/// Per-task algorithm settings, stored next to the task's frames.
pub const ALGO_CONFIG_FILE: &str = "algo_config.json";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No admission slot within {0:?}")]
    Saturated(Duration),
    #[error("Admission limiter closed")]
    LimiterClosed,
    #[error("Failed to sign image URL: {0}")]
    Sign(#[from] StoreError),
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid response: {0}")]
    Decode(String),
    #[error("Algorithm rejected image: {0}")]
    Rejected(String),
}

/// Tunables for [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrent: usize,
    pub request_timeout: Duration,
    /// `None` waits for a slot indefinitely.
    pub admission_timeout: Option<Duration>,
    pub url_ttl: Duration,
    pub save_only_with_detection: bool,
    /// Frames with detections move under this prefix. Empty leaves them in place.
    pub alert_base_path: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            request_timeout: Duration::from_secs(30),
            admission_timeout: None,
            url_ttl: Duration::from_secs(3600),
            save_only_with_detection: false,
            alert_base_path: "alerts".to_string(),
        }
    }
}

/// Outcome of scheduling one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Parsed `algo_config.json` and a signed link to it.
#[derive(Debug, Clone, Default)]
struct AlgoConfig {
    value: Option<Value>,
    url: Option<String>,
}

enum Outcome {
    Completed(AlertRecord),
    Failed,
    /// Never reached the algorithm.
    Skipped,
}

pub struct Scheduler {
    registry: Arc<AlgorithmRegistry>,
    monitor: Arc<PerformanceMonitor>,
    store: Arc<dyn ObjectStore>,
    alert_store: Arc<dyn AlertStore>,
    publisher: Arc<dyn AlertPublisher>,
    http_client: reqwest::Client,
    limiter: Arc<Semaphore>,
    options: SchedulerOptions,
    active: AtomicUsize,
}

impl Scheduler {
    pub fn new(
        registry: Arc<AlgorithmRegistry>,
        monitor: Arc<PerformanceMonitor>,
        store: Arc<dyn ObjectStore>,
        alert_store: Arc<dyn AlertStore>,
        publisher: Arc<dyn AlertPublisher>,
        options: SchedulerOptions,
    ) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            registry,
            monitor,
            store,
            alert_store,
            publisher,
            http_client,
            limiter: Arc::new(Semaphore::new(options.max_concurrent.max(1))),
            options,
            active: AtomicUsize::new(0),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.options.max_concurrent.max(1)
    }

    /// Dispatches currently holding an admission slot.
    pub fn active_inferences(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Dispatch `image` to every instance serving its task type and wait for all of them.
    ///
    /// Afterwards the frame moves under the alert prefix if any algorithm
    /// detected something, and is deleted otherwise.
    pub async fn schedule_inference(&self, image: &PendingImage) -> DispatchSummary {
        let instances = self.registry.get_algorithms(&image.task_type).await;
        if instances.is_empty() {
            tracing::debug!(
                "No algorithm registered for task type {}, skipping {}",
                image.task_type,
                image.path
            );
            return DispatchSummary::default();
        }

        let algo_config = self.load_algo_config(image).await;
        let outcomes = join_all(
            instances
                .iter()
                .map(|instance| self.dispatch_logged(instance, image, &algo_config)),
        )
        .await;

        let mut summary = DispatchSummary {
            attempted: outcomes.len(),
            ..DispatchSummary::default()
        };
        let mut skipped = 0;
        let mut alerts = vec![];
        for outcome in outcomes {
            match outcome {
                Outcome::Completed(alert) => {
                    summary.succeeded += 1;
                    alerts.push(alert);
                }
                Outcome::Failed => summary.failed += 1,
                Outcome::Skipped => {
                    summary.failed += 1;
                    skipped += 1;
                }
            }
        }
        if skipped == summary.attempted {
            return summary;
        }

        let detected = alerts.iter().any(|alert| alert.detection_count > 0);
        let relocated = if detected {
            self.move_to_alerts(image).await
        } else {
            self.discard(image).await;
            None
        };

        for mut alert in alerts {
            if alert.detection_count == 0 && self.options.save_only_with_detection {
                tracing::debug!("No detections in {}, not saving", image.path);
                continue;
            }
            if alert.detection_count > 0 {
                if let Some((key, url)) = &relocated {
                    alert.image_path = key.clone();
                    alert.image_url = url.clone();
                }
            }
            if let Err(e) = self.alert_store.create(&alert).await {
                tracing::error!("Failed to save alert for {}: {}", image.path, e);
            }
            if let Err(e) = self.publisher.publish(&alert).await {
                tracing::warn!("Failed to publish alert {}: {}", alert.id, e);
            }
        }

        summary
    }

    async fn load_algo_config(&self, image: &PendingImage) -> AlgoConfig {
        let Some((dir, _)) = image.path.rsplit_once('/') else {
            return AlgoConfig::default();
        };
        let key = format!("{}/{}", dir, ALGO_CONFIG_FILE);

        let bytes = match self.store.get(&key).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return AlgoConfig::default(),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", key, e);
                return AlgoConfig::default();
            }
        };

        let value = match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Invalid algorithm config {}: {}", key, e);
                None
            }
        };
        let url = match self.store.presign_get(&key, self.options.url_ttl).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!("Failed to sign {}: {}", key, e);
                None
            }
        };
        AlgoConfig { value, url }
    }

    fn alert_key(&self, image: &PendingImage) -> Option<String> {
        let prefix = self.options.alert_base_path.trim_end_matches('/');
        if prefix.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/{}/{}",
            prefix, image.task_type, image.task_id, image.filename
        ))
    }

    /// Copy the frame under the alert prefix and drop the original.
    /// Returns the new key and a signed URL for it.
    async fn move_to_alerts(&self, image: &PendingImage) -> Option<(String, String)> {
        let target = self.alert_key(image)?;
        if let Err(e) = self.store.copy(&image.path, &target).await {
            tracing::error!("Failed to move {} to {}: {}", image.path, target, e);
            return None;
        }
        if let Err(e) = self.store.delete(&image.path).await {
            tracing::warn!("Moved {} but could not delete it: {}", image.path, e);
        }
        tracing::debug!("Moved {} to {}", image.path, target);

        let url = match self.store.presign_get(&target, self.options.url_ttl).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Failed to sign {}: {}", target, e);
                String::new()
            }
        };
        Some((target, url))
    }

    async fn discard(&self, image: &PendingImage) {
        match self.store.delete(&image.path).await {
            Ok(()) => tracing::debug!("Deleted {}", image.path),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => tracing::warn!("Failed to delete {}: {}", image.path, e),
        }
    }

    async fn dispatch_logged(
        &self,
        instance: &AlgorithmInstance,
        image: &PendingImage,
        algo_config: &AlgoConfig,
    ) -> Outcome {
        let started = Instant::now();
        match self.dispatch(instance, image, algo_config).await {
            Ok(alert) => Outcome::Completed(alert),
            Err(DispatchError::Saturated(wait)) => {
                tracing::warn!(
                    "Gave up on {} for {} after waiting {:?} for a slot",
                    image.path,
                    instance.service_id,
                    wait
                );
                Outcome::Skipped
            }
            Err(e) => {
                tracing::warn!(
                    "Inference of {} on {} ({}) failed: {}",
                    image.path,
                    instance.service_id,
                    instance.endpoint,
                    e
                );
                self.registry
                    .record_inference_failure(&instance.endpoint, &instance.service_id)
                    .await;
                self.monitor
                    .record_inference(started.elapsed().as_millis() as u64, false);
                Outcome::Failed
            }
        }
    }

    async fn dispatch(
        &self,
        instance: &AlgorithmInstance,
        image: &PendingImage,
        algo_config: &AlgoConfig,
    ) -> Result<AlertRecord, DispatchError> {
        let _permit = match self.options.admission_timeout {
            Some(wait) => tokio::time::timeout(wait, self.limiter.acquire())
                .await
                .map_err(|_| DispatchError::Saturated(wait))?,
            None => self.limiter.acquire().await,
        }
        .map_err(|_| DispatchError::LimiterClosed)?;

        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self.call_algorithm(instance, image, algo_config).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn call_algorithm(
        &self,
        instance: &AlgorithmInstance,
        image: &PendingImage,
        algo_config: &AlgoConfig,
    ) -> Result<AlertRecord, DispatchError> {
        let image_url = self.store.presign_get(&image.path, self.options.url_ttl).await?;
        let request = InferenceRequest {
            image_url: image_url.clone(),
            task_id: image.task_id.clone(),
            task_type: image.task_type.clone(),
            image_path: image.path.clone(),
            algo_config: algo_config.value.clone(),
            algo_config_url: algo_config.url.clone(),
        };

        let started = Instant::now();
        let response = self
            .http_client
            .post(&instance.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: InferenceResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Decode(e.to_string()))?;
        let measured_ms = started.elapsed().as_millis() as u64;

        if !body.success {
            return Err(DispatchError::Rejected(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let elapsed_ms = if body.inference_time_ms > 0.0 {
            body.inference_time_ms.round() as u64
        } else {
            measured_ms
        };

        self.registry
            .record_inference_success(&instance.endpoint, elapsed_ms)
            .await;
        self.monitor.record_inference(elapsed_ms, true);

        let alert = AlertRecord::new(
            image.task_id.clone(),
            image.task_type.clone(),
            image.path.clone(),
            image_url,
            instance.service_id.clone(),
            instance.name.clone(),
            instance.endpoint.clone(),
            body.result,
            body.confidence,
            elapsed_ms,
        );

        tracing::info!(
            "{} processed {} in {}ms ({} detections)",
            instance.service_id,
            image.path,
            elapsed_ms,
            alert.detection_count
        );
        Ok(alert)
    }
}
