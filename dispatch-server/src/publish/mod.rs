//! Downstream publication of alert records.

mod ws;

pub use ws::WebSocketPublisher;

use async_trait::async_trait;
use dispatch_common::AlertRecord;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Publisher backlog full, dropped alert {0}")]
    Backpressure(String),
    #[error("Publisher closed")]
    Closed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait AlertPublisher: Send + Sync {
    async fn publish(&self, alert: &AlertRecord) -> Result<(), PublishError>;
}

/// Publisher used when no broker is configured.
#[derive(Debug, Default)]
pub struct NoopPublisher;

#[async_trait]
impl AlertPublisher for NoopPublisher {
    async fn publish(&self, alert: &AlertRecord) -> Result<(), PublishError> {
        tracing::trace!("No broker configured, not publishing alert {}", alert.id);
        Ok(())
    }
}
