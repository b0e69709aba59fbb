//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::detector::Detector;
use crate::stats::StatsTracker;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub detector: Arc<dyn Detector>,
    pub stats: Arc<StatsTracker>,
    /// Client used to download images.
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: Config,
        detector: Arc<dyn Detector>,
        stats: Arc<StatsTracker>,
    ) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.detector.fetch_timeout_secs))
            .build()?;
        Ok(Self {
            config,
            detector,
            stats,
            http_client,
        })
    }
}
