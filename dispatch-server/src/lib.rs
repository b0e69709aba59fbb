pub mod alerts;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod producer;
pub mod publish;
pub mod routes;
pub mod store;

pub use config::Config;
pub use dispatch::{AlgorithmRegistry, InferenceQueue, PerformanceMonitor, Pipeline, Scheduler};
pub use error::ApiError;
pub use producer::{Producer, ProducerStatus};

use std::sync::{Arc, OnceLock};

use alerts::AlertStore;
use dispatch::SystemAlertLog;
use store::LocalObjectStore;

/// Everything that exists only once the dispatch pipeline is running.
pub struct DispatchHandles {
    pub pipeline: Arc<Pipeline>,
    pub alert_store: Arc<dyn AlertStore>,
    pub system_alerts: Arc<SystemAlertLog>,
    pub producer: Arc<Producer>,
}

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Algorithm registry, available from startup so services can register early.
    pub registry: Arc<AlgorithmRegistry>,
    /// Set once by [`AppState::install`]; endpoints needing it answer 503 before that.
    dispatch: OnceLock<DispatchHandles>,
    /// Local store served under `/objects` when configured.
    pub objects: Option<Arc<LocalObjectStore>>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<AlgorithmRegistry>) -> Self {
        Self {
            config,
            registry,
            dispatch: OnceLock::new(),
            objects: None,
        }
    }

    pub fn with_objects(mut self, objects: Arc<LocalObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Make the running pipeline visible to the control plane.
    /// Returns false if it was already installed.
    pub fn install(&self, handles: DispatchHandles) -> bool {
        self.dispatch.set(handles).is_ok()
    }

    pub fn dispatch(&self) -> Result<&DispatchHandles, ApiError> {
        self.dispatch.get().ok_or(ApiError::NotReady("Dispatch service"))
    }
}
