//! Registry of algorithm service instances.
//!
//! Instances are grouped by task category. Liveness is driven only by
//! heartbeats; call outcomes feed the latency samples that weight the
//! load balancer but never remove an instance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dispatch_common::{ServiceRegistration, ServiceStats};

/// Successful call durations kept per endpoint.
pub const LATENCY_WINDOW: usize = 10;
/// Weight of an instance that has no latency sample yet.
pub const BOOTSTRAP_WEIGHT: u64 = 10;
const MIN_WEIGHT: u64 = 1;
const MAX_WEIGHT: u64 = 100;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),
    #[error("Service not found: {0}")]
    NotFound(String),
}

/// One registered algorithm service instance, keyed by endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmInstance {
    pub service_id: String,
    pub name: String,
    pub endpoint: String,
    pub task_types: Vec<String>,
    pub version: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Counters self-reported through heartbeats.
    pub stats: ServiceStats,
}

/// How a heartbeat identifies its instances.
#[derive(Debug, Clone, Copy)]
pub enum InstanceKey<'a> {
    ServiceId(&'a str),
    Endpoint(&'a str),
}

impl InstanceKey<'_> {
    fn matches(&self, instance: &AlgorithmInstance) -> bool {
        match self {
            InstanceKey::ServiceId(id) => instance.service_id == *id,
            InstanceKey::Endpoint(endpoint) => instance.endpoint == *endpoint,
        }
    }
}

impl fmt::Display for InstanceKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::ServiceId(id) => write!(f, "service_id={}", id),
            InstanceKey::Endpoint(endpoint) => write!(f, "endpoint={}", endpoint),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnregisterReason {
    Explicit,
    HeartbeatTimeout,
}

impl UnregisterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnregisterReason::Explicit => "explicit",
            UnregisterReason::HeartbeatTimeout => "heartbeat_timeout",
        }
    }
}

/// Membership change, delivered to subscribers after the registry lock is released.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered {
        service_id: String,
        endpoint: String,
        task_types: Vec<String>,
    },
    Unregistered {
        service_id: String,
        endpoint: String,
        reason: UnregisterReason,
    },
}

/// Most recent successful call durations of one endpoint.
#[derive(Debug, Default)]
struct LatencySample {
    samples: VecDeque<u64>,
}

impl LatencySample {
    fn push(&mut self, elapsed_ms: u64) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed_ms);
    }

    fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum as f64 / self.samples.len() as f64)
    }
}

fn weight_for(sample: Option<&LatencySample>) -> u64 {
    match sample.and_then(LatencySample::average) {
        None => BOOTSTRAP_WEIGHT,
        Some(avg) if avg <= 0.0 => MAX_WEIGHT,
        Some(avg) => ((1000.0 / avg).round() as u64).clamp(MIN_WEIGHT, MAX_WEIGHT),
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Task category -> instances, each endpoint at most once per category.
    categories: HashMap<String, Vec<AlgorithmInstance>>,
    latencies: HashMap<String, LatencySample>,
    call_counts: HashMap<String, u64>,
    /// Weighted round-robin cursor per category.
    cursors: HashMap<String, u64>,
}

impl RegistryState {
    fn has_endpoint(&self, endpoint: &str) -> bool {
        self.categories
            .values()
            .any(|entries| entries.iter().any(|e| e.endpoint == endpoint))
    }

    /// Remove matching entries from every category.
    ///
    /// Returns the removed instances, one per endpoint.
    fn remove_where<F>(&mut self, mut predicate: F) -> Vec<AlgorithmInstance>
    where
        F: FnMut(&AlgorithmInstance) -> bool,
    {
        let mut removed: Vec<AlgorithmInstance> = vec![];
        for entries in self.categories.values_mut() {
            entries.retain(|entry| {
                if predicate(entry) {
                    if !removed.iter().any(|r| r.endpoint == entry.endpoint) {
                        removed.push(entry.clone());
                    }
                    false
                } else {
                    true
                }
            });
        }
        self.categories.retain(|_, entries| !entries.is_empty());

        for instance in &removed {
            if !self.has_endpoint(&instance.endpoint) {
                self.latencies.remove(&instance.endpoint);
                self.call_counts.remove(&instance.endpoint);
            }
        }

        removed
    }
}

/// Instance listing entry with its dispatcher-side call count.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    #[serde(flatten)]
    pub instance: AlgorithmInstance,
    pub call_count: u64,
}

/// Load-balancing view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceEntry {
    pub service_id: String,
    pub endpoint: String,
    pub weight: u64,
    pub samples: usize,
    pub avg_latency_ms: Option<f64>,
    pub call_count: u64,
}

/// Load-balancing view of one task category.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryBalance {
    pub category: String,
    pub cursor: u64,
    pub total_weight: u64,
    pub instances: Vec<BalanceEntry>,
}

/// Registry of algorithm service instances.
#[derive(Debug)]
pub struct AlgorithmRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    heartbeat_timeout: chrono::Duration,
}

impl AlgorithmRegistry {
    /// Create an empty registry whose liveness sweep drops instances
    /// silent for at least `heartbeat_timeout`.
    pub fn new(heartbeat_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
            heartbeat_timeout: chrono::Duration::milliseconds(heartbeat_timeout.as_millis() as i64),
        }
    }

    /// Subscribe to registration and unregistration events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register an instance under each of its task categories.
    ///
    /// An existing entry with the same endpoint is replaced, and the
    /// category's round-robin cursor starts over.
    pub async fn register(
        &self,
        registration: ServiceRegistration,
    ) -> Result<AlgorithmInstance, RegistryError> {
        let service_id = registration.service_id.trim().to_string();
        let endpoint = registration.endpoint.trim().to_string();
        if service_id.is_empty() {
            return Err(RegistryError::Validation("service_id is required".to_string()));
        }
        if endpoint.is_empty() {
            return Err(RegistryError::Validation("endpoint is required".to_string()));
        }

        let mut task_types: Vec<String> = vec![];
        for task_type in registration.task_types {
            let task_type = task_type.trim().to_string();
            if !task_type.is_empty() && !task_types.contains(&task_type) {
                task_types.push(task_type);
            }
        }
        if task_types.is_empty() {
            return Err(RegistryError::Validation(
                "task_types must contain at least one category".to_string(),
            ));
        }

        let now = Utc::now();
        let instance = AlgorithmInstance {
            service_id,
            name: registration.name,
            endpoint,
            task_types,
            version: registration.version,
            registered_at: now,
            last_heartbeat: now,
            stats: ServiceStats::default(),
        };

        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            for category in &instance.task_types {
                let entries = state.categories.entry(category.clone()).or_default();
                let before = entries.len();
                entries.retain(|e| e.endpoint != instance.endpoint);
                if entries.len() != before {
                    tracing::info!(
                        "Replacing instance {} in category {}",
                        instance.endpoint,
                        category
                    );
                    state.cursors.insert(category.clone(), 0);
                }
                entries.push(instance.clone());
            }
        }

        tracing::info!(
            "Registered algorithm service {} at {} for {:?}",
            instance.service_id,
            instance.endpoint,
            instance.task_types
        );

        let _ = self.events.send(RegistryEvent::Registered {
            service_id: instance.service_id.clone(),
            endpoint: instance.endpoint.clone(),
            task_types: instance.task_types.clone(),
        });

        Ok(instance)
    }

    /// Remove every instance registered under `service_id`.
    pub async fn unregister(&self, service_id: &str) -> Result<Vec<AlgorithmInstance>, RegistryError> {
        let removed = self
            .state
            .write()
            .await
            .remove_where(|e| e.service_id == service_id);

        if removed.is_empty() {
            return Err(RegistryError::NotFound(service_id.to_string()));
        }

        tracing::info!(
            "Unregistered algorithm service {} ({} instances)",
            service_id,
            removed.len()
        );
        self.emit_unregistered(&removed, UnregisterReason::Explicit);

        Ok(removed)
    }

    /// Refresh liveness of every instance matching `key`, optionally
    /// replacing its self-reported stats. Returns the number of entries touched.
    pub async fn heartbeat(
        &self,
        key: InstanceKey<'_>,
        stats: Option<ServiceStats>,
    ) -> Result<usize, RegistryError> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let mut matched = 0;
        for entries in state.categories.values_mut() {
            for entry in entries.iter_mut().filter(|e| key.matches(e)) {
                entry.last_heartbeat = now;
                if let Some(stats) = &stats {
                    entry.stats = stats.clone();
                }
                matched += 1;
            }
        }

        if matched == 0 {
            return Err(RegistryError::NotFound(key.to_string()));
        }

        tracing::debug!("Heartbeat from {} ({} entries)", key, matched);
        Ok(matched)
    }

    /// Record a successful call duration for `endpoint`.
    pub async fn record_inference_success(&self, endpoint: &str, elapsed_ms: u64) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if !state.has_endpoint(endpoint) {
            tracing::debug!("Ignoring latency for unregistered endpoint {}", endpoint);
            return;
        }
        state
            .latencies
            .entry(endpoint.to_string())
            .or_default()
            .push(elapsed_ms);
        *state.call_counts.entry(endpoint.to_string()).or_insert(0) += 1;
    }

    /// Record a failed call. The instance stays registered.
    pub async fn record_inference_failure(&self, endpoint: &str, service_id: &str) {
        tracing::warn!(
            "Inference failed on {} (service {}), instance kept until heartbeat expiry",
            endpoint,
            service_id
        );
    }

    /// Snapshot of the instances serving `category`.
    pub async fn get_algorithms(&self, category: &str) -> Vec<AlgorithmInstance> {
        self.state
            .read()
            .await
            .categories
            .get(category)
            .cloned()
            .unwrap_or_default()
    }

    /// Pick one instance of `category` by weighted round robin.
    ///
    /// Each candidate's weight is `clamp(round(1000 / avg_latency_ms), 1, 100)`,
    /// or [`BOOTSTRAP_WEIGHT`] without samples. The category cursor advances
    /// on every call; call counts are only touched on recorded success.
    pub async fn select_for_load_balance(&self, category: &str) -> Option<AlgorithmInstance> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let candidates = state.categories.get(category).filter(|c| !c.is_empty())?;
        let weights: Vec<u64> = candidates
            .iter()
            .map(|c| weight_for(state.latencies.get(&c.endpoint)))
            .collect();
        let total: u64 = weights.iter().sum();

        let cursor = state.cursors.entry(category.to_string()).or_insert(0);
        let tick = *cursor;
        *cursor = cursor.wrapping_add(1);

        if total > 0 {
            let slot = tick % total;
            let mut upper = 0;
            for (candidate, weight) in candidates.iter().zip(&weights) {
                upper += weight;
                if slot < upper {
                    return Some(candidate.clone());
                }
            }
        }

        let index = (tick % candidates.len() as u64) as usize;
        Some(candidates[index].clone())
    }

    /// Remove instances whose last heartbeat is at least the timeout old.
    pub async fn remove_expired(&self) -> Vec<AlgorithmInstance> {
        self.remove_expired_at(Utc::now()).await
    }

    /// [`remove_expired`](Self::remove_expired) evaluated at `now`.
    pub async fn remove_expired_at(&self, now: DateTime<Utc>) -> Vec<AlgorithmInstance> {
        let timeout = self.heartbeat_timeout;
        let removed = self
            .state
            .write()
            .await
            .remove_where(|e| now - e.last_heartbeat >= timeout);

        for instance in &removed {
            tracing::warn!(
                "Removing algorithm service {} at {} (no heartbeat for {}s)",
                instance.service_id,
                instance.endpoint,
                (now - instance.last_heartbeat).num_seconds()
            );
        }
        self.emit_unregistered(&removed, UnregisterReason::HeartbeatTimeout);

        removed
    }

    /// Run the liveness sweep every `interval` until `cancel` fires.
    pub fn spawn_heartbeat_checker(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.remove_expired().await;
                        if !removed.is_empty() {
                            tracing::info!("Heartbeat sweep removed {} instances", removed.len());
                        }
                    }
                }
            }
            tracing::debug!("Heartbeat checker stopped");
        })
    }

    /// Every instance across categories, one entry per endpoint.
    pub async fn list_instances(&self) -> Vec<InstanceSummary> {
        let state = self.state.read().await;
        let mut seen = HashSet::new();
        let mut summaries = vec![];

        let mut categories: Vec<_> = state.categories.keys().collect();
        categories.sort();
        for category in categories {
            for instance in &state.categories[category] {
                if seen.insert(instance.endpoint.clone()) {
                    summaries.push(InstanceSummary {
                        instance: instance.clone(),
                        call_count: state.call_counts.get(&instance.endpoint).copied().unwrap_or(0),
                    });
                }
            }
        }

        summaries
    }

    /// Current weights, samples and cursors per category.
    pub async fn load_balance_info(&self) -> Vec<CategoryBalance> {
        let state = self.state.read().await;
        let mut info: Vec<CategoryBalance> = state
            .categories
            .iter()
            .map(|(category, entries)| {
                let instances: Vec<BalanceEntry> = entries
                    .iter()
                    .map(|e| {
                        let sample = state.latencies.get(&e.endpoint);
                        BalanceEntry {
                            service_id: e.service_id.clone(),
                            endpoint: e.endpoint.clone(),
                            weight: weight_for(sample),
                            samples: sample.map(|s| s.samples.len()).unwrap_or(0),
                            avg_latency_ms: sample.and_then(LatencySample::average),
                            call_count: state.call_counts.get(&e.endpoint).copied().unwrap_or(0),
                        }
                    })
                    .collect();
                CategoryBalance {
                    category: category.clone(),
                    cursor: state.cursors.get(category).copied().unwrap_or(0),
                    total_weight: instances.iter().map(|i| i.weight).sum(),
                    instances,
                }
            })
            .collect();

        info.sort_by(|a, b| a.category.cmp(&b.category));
        info
    }

    /// Drop every instance. Returns the number of endpoints removed.
    pub async fn clear_all(&self) -> usize {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.remove_where(|_| true);
            state.cursors.clear();
            removed
        };

        tracing::info!("Cleared {} algorithm service instances", removed.len());
        self.emit_unregistered(&removed, UnregisterReason::Explicit);
        removed.len()
    }

    /// Number of distinct endpoints registered.
    pub async fn count(&self) -> usize {
        let state = self.state.read().await;
        state
            .categories
            .values()
            .flatten()
            .map(|e| e.endpoint.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    fn emit_unregistered(&self, removed: &[AlgorithmInstance], reason: UnregisterReason) {
        for instance in removed {
            let _ = self.events.send(RegistryEvent::Unregistered {
                service_id: instance.service_id.clone(),
                endpoint: instance.endpoint.clone(),
                reason,
            });
        }
    }
}
