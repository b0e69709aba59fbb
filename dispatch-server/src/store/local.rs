//! Object store backed by a local directory tree.
//!
//! Keys are `/`-separated paths relative to the root. Change subscriptions
//! poll the tree and emit the differences between two listings.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ObjectEvent, ObjectEventStream, ObjectInfo, ObjectStore, StoreError, UrlSigner};

const SUBSCRIBER_BUFFER: usize = 256;

/// Directory-backed store that hands out signed URLs served by the dispatcher.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
    signer: UrlSigner,
    poll_interval: Duration,
}

impl LocalObjectStore {
    pub fn new(
        root: impl Into<PathBuf>,
        public_base_url: &str,
        signer: UrlSigner,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        tracing::info!("Local object store at {}", root.display());
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signer,
            poll_interval,
        })
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Resolve a key to a path under the root, rejecting escapes.
    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn snapshot(&self, prefix: &str) -> Result<HashMap<String, ObjectInfo>, StoreError> {
        Ok(self
            .list(prefix)
            .await?
            .into_iter()
            .map(|info| (info.key.clone(), info))
            .collect())
    }
}

fn walk(root: &Path, dir: &Path, prefix: &str, out: &mut Vec<ObjectInfo>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            walk(root, &path, prefix, out)?;
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !key.starts_with(prefix) {
            continue;
        }

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        out.push(ObjectInfo {
            key,
            size: metadata.len(),
            last_modified,
        });
    }

    Ok(())
}

/// Directory to start walking from: the deepest directory fully named by `prefix`.
fn walk_start(root: &Path, prefix: &str) -> PathBuf {
    match prefix.rfind('/') {
        Some(idx) => root.join(&prefix[..idx]),
        None => root.to_path_buf(),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let listed = tokio::task::spawn_blocking(move || {
            let mut out = vec![];
            walk(&root, &walk_start(&root, &prefix), &prefix, &mut out)?;
            Ok::<_, std::io::Error>(out)
        })
        .await
        .map_err(|e| StoreError::Transport(format!("listing task failed: {}", e)))??;
        Ok(listed)
    }

    async fn subscribe(&self, prefix: &str) -> Result<ObjectEventStream, StoreError> {
        let mut known = self.snapshot(prefix).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let store = self.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let current = match store.snapshot(&prefix).await {
                    Ok(current) => current,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };

                let mut events = vec![];
                for (key, info) in &current {
                    match known.get(key) {
                        Some(previous) if previous.last_modified == info.last_modified => {}
                        _ => events.push(ObjectEvent::Created(info.clone())),
                    }
                }
                for key in known.keys() {
                    if !current.contains_key(key) {
                        events.push(ObjectEvent::Removed { key: key.clone() });
                    }
                }
                known = current;

                for event in events {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!("Local store poller for '{}' stopped", prefix);
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StoreError> {
        let path = self.resolve(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;

        let mut url = reqwest::Url::parse(&self.public_base_url)
            .map_err(|e| StoreError::Transport(format!("bad public base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Transport("public base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push("objects")
            .extend(key.split('/'));
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &self.signer.sign(key, expires));
        Ok(url.into())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(&source, &target).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(from.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> LocalObjectStore {
        LocalObjectStore::new(
            dir.path(),
            "http://dispatch:8090/",
            UrlSigner::new("secret"),
            Duration::from_millis(20),
        )
        .unwrap()
    }

    fn write(dir: &tempfile::TempDir, key: &str, data: &[u8]) {
        let path = dir.path().join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn test_list_recurses_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "frames/helmet/cam-1/a.jpg", b"abc");
        write(&dir, "frames/person/cam-2/b.jpg", b"de");
        write(&dir, "alerts/helmet/cam-1/a.jpg", b"x");

        let store = store(&dir);
        let mut keys: Vec<_> = store
            .list("frames/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["frames/helmet/cam-1/a.jpg", "frames/person/cam-2/b.jpg"]);
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).list("frames/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presign_produces_verifiable_url() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "frames/helmet/cam-1/a.jpg", b"abc");
        let store = store(&dir);

        let url = store
            .presign_get("frames/helmet/cam-1/a.jpg", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("http://dispatch:8090/objects/frames/helmet/cam-1/a.jpg?expires="));

        let query = url.split_once('?').unwrap().1;
        let params: HashMap<_, _> = query
            .split('&')
            .filter_map(|p| p.split_once('='))
            .collect();
        let expires: i64 = params["expires"].parse().unwrap();
        assert!(UrlSigner::new("secret")
            .verify("frames/helmet/cam-1/a.jpg", expires, params["signature"], Utc::now().timestamp())
            .is_ok());
    }

    #[tokio::test]
    async fn test_presign_encodes_key_segments() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "frames/helmet/cam 1/a#1.jpg", b"abc");
        let store = store(&dir);

        let url = store
            .presign_get("frames/helmet/cam 1/a#1.jpg", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("http://dispatch:8090/objects/frames/helmet/cam%201/a%231.jpg?expires="));

        let parsed = reqwest::Url::parse(&url).unwrap();
        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        let expires: i64 = params["expires"].parse().unwrap();
        assert!(UrlSigner::new("secret")
            .verify("frames/helmet/cam 1/a#1.jpg", expires, &params["signature"], Utc::now().timestamp())
            .is_ok());
    }

    #[tokio::test]
    async fn test_copy_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "frames/helmet/cam-1/a.jpg", b"abc");
        let store = store(&dir);

        store
            .copy("frames/helmet/cam-1/a.jpg", "alerts/helmet/cam-1/a.jpg")
            .await
            .unwrap();
        assert_eq!(store.get("alerts/helmet/cam-1/a.jpg").await.unwrap(), b"abc");
        assert_eq!(store.get("frames/helmet/cam-1/a.jpg").await.unwrap(), b"abc");
        assert!(matches!(
            store.copy("frames/missing.jpg", "alerts/missing.jpg").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.copy("frames/helmet/cam-1/a.jpg", "../x.jpg").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(matches!(store.get("../etc/passwd").await, Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.delete("/etc/passwd").await, Err(StoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_get_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "frames/helmet/cam-1/a.jpg", b"abc");
        let store = store(&dir);

        assert_eq!(store.get("frames/helmet/cam-1/a.jpg").await.unwrap(), b"abc");
        store.delete("frames/helmet/cam-1/a.jpg").await.unwrap();
        assert!(matches!(
            store.get("frames/helmet/cam-1/a.jpg").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_reports_diffs() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "frames/helmet/cam-1/old.jpg", b"1");
        let store = store(&dir);
        let mut events = store.subscribe("frames/").await.unwrap();

        write(&dir, "frames/helmet/cam-1/new.jpg", b"2");
        std::fs::remove_file(dir.path().join("frames/helmet/cam-1/old.jpg")).unwrap();

        let mut seen = vec![];
        while seen.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push(event);
        }

        assert!(seen
            .iter()
            .any(|e| matches!(e, ObjectEvent::Created(info) if info.key == "frames/helmet/cam-1/new.jpg")));
        assert!(seen.contains(&ObjectEvent::Removed {
            key: "frames/helmet/cam-1/old.jpg".to_string()
        }));
    }
}
