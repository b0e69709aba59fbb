//! Object store abstraction.
//!
//! The dispatcher needs listing, change notifications, short-lived signed
//! read URLs, reads, copies and deletion from the store holding extracted
//! frames. [`ObjectStore`] captures exactly that.

mod local;
mod memory;
mod signing;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use signing::{SignatureError, UrlSigner};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Change notification from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectEvent {
    Created(ObjectInfo),
    Removed { key: String },
}

impl ObjectEvent {
    pub fn key(&self) -> &str {
        match self {
            ObjectEvent::Created(info) => &info.key,
            ObjectEvent::Removed { key } => key,
        }
    }
}

/// Stream of change notifications. Ends when the underlying channel closes.
pub type ObjectEventStream = BoxStream<'static, Result<ObjectEvent, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
    #[error("Object store unavailable: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the dispatcher needs from the object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short identifier for logs ("local", "memory", ...).
    fn name(&self) -> &str;

    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError>;

    /// Subscribe to creations and removals under `prefix`.
    ///
    /// Dropping the stream cancels the subscription.
    async fn subscribe(&self, prefix: &str) -> Result<ObjectEventStream, StoreError>;

    /// Time-limited URL granting read access to `key`.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StoreError>;

    /// Read the object body.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Copy `from` to `to`, overwriting any existing object.
    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
