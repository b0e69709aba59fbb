//! Persistence of inference alert records.

mod sqlite;

pub use sqlite::SqliteAlertStore;

use async_trait::async_trait;
use dispatch_common::AlertRecord;

#[derive(Debug, thiserror::Error)]
pub enum AlertStoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
}

/// Where successful inference results are persisted.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create(&self, alert: &AlertRecord) -> Result<(), AlertStoreError>;

    /// Most recent records first.
    async fn recent(&self, limit: usize) -> Result<Vec<AlertRecord>, AlertStoreError>;
}
