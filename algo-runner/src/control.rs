//! Control-plane client: keeps this runner registered with the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use dispatch_common::{HeartbeatRequest, RegisterResponse, ServiceRegistration, API_PREFIX};

use crate::stats::StatsTracker;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Control plane request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Control plane rejected request ({status}): {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("Dispatcher does not know this service")]
    NotRegistered,
}

pub struct ControlPlaneClient {
    base_url: String,
    registration: ServiceRegistration,
    stats: Arc<StatsTracker>,
    heartbeat_interval: Duration,
    retry_delay: Duration,
    client: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: &str,
        registration: ServiceRegistration,
        stats: Arc<StatsTracker>,
        heartbeat_interval: Duration,
        retry_delay: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            registration,
            stats,
            heartbeat_interval,
            retry_delay,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    pub async fn register(&self) -> Result<(), ControlError> {
        let response = self
            .client
            .post(self.url("/register"))
            .json(&self.registration)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::Rejected { status, body });
        }

        let reply: RegisterResponse = response.json().await?;
        if !reply.ok {
            return Err(ControlError::Rejected {
                status,
                body: "registration not acknowledged".to_string(),
            });
        }
        Ok(())
    }

    /// Send one heartbeat carrying the current stats.
    pub async fn heartbeat(&self) -> Result<(), ControlError> {
        let body = HeartbeatRequest::with_stats(&self.stats.snapshot());
        let response = self
            .client
            .post(self.url(&format!("/heartbeat/{}", self.registration.service_id)))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ControlError::NotRegistered),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ControlError::Rejected { status, body })
            }
        }
    }

    /// Register, then heartbeat until cancelled. Registers again whenever the
    /// dispatcher has forgotten this service.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if !self.register_until_accepted(&cancel).await {
                return;
            }
            tracing::info!(
                "Registered {} at {} with the dispatcher",
                self.registration.service_id,
                self.registration.endpoint
            );

            let mut ticker = interval(self.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match self.heartbeat().await {
                    Ok(()) => tracing::debug!("Heartbeat sent"),
                    Err(ControlError::NotRegistered) => {
                        tracing::warn!("Dispatcher dropped this service, registering again");
                        break;
                    }
                    Err(e) => tracing::warn!("Heartbeat failed: {}", e),
                }
            }
        }
    }

    /// Returns false if cancelled first.
    async fn register_until_accepted(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.register().await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(
                        "Registration failed: {}. Retrying in {:?}",
                        e,
                        self.retry_delay
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep(self.retry_delay) => {}
            }
        }
    }
}
