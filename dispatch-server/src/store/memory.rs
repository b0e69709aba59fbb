//! In-process object store with push notifications.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use super::{ObjectEvent, ObjectEventStream, ObjectInfo, ObjectStore, StoreError};

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::Sender<Result<ObjectEvent, StoreError>>,
}

/// Object store kept entirely in memory.
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    subscribers: Mutex<Vec<Subscriber>>,
    available: AtomicBool,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(vec![]),
            available: AtomicBool::new(true),
        }
    }

    /// Store an object and notify subscribers.
    pub async fn put(&self, key: &str, data: Vec<u8>) {
        let modified = Utc::now();
        let info = ObjectInfo {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified: modified,
        };
        self.objects
            .write()
            .await
            .insert(key.to_string(), StoredObject { data, modified });
        self.notify(ObjectEvent::Created(info)).await;
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    /// Simulate an outage: listing and subscribing fail until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Close every open subscription stream.
    pub async fn disconnect_subscribers(&self) {
        self.subscribers.lock().await.clear();
    }

    /// Number of open subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Transport("memory store offline".to_string()))
        }
    }

    async fn notify(&self, event: ObjectEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if event.key().starts_with(&subscriber.prefix)
                && subscriber.tx.try_send(Ok(event.clone())).is_err()
            {
                tracing::warn!("Dropping notification for {}: subscriber is full", event.key());
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.modified,
            })
            .collect())
    }

    async fn subscribe(&self, prefix: &str) -> Result<ObjectEventStream, StoreError> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().await.push(Subscriber {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StoreError> {
        if !self.exists(key).await {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("memory://{}?expires={}", key, expires))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.data.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let data = self.get(from).await?;
        self.put(to, data).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.objects.write().await.remove(key).is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.notify(ObjectEvent::Removed {
            key: key.to_string(),
        })
        .await;
        Ok(())
    }
}
