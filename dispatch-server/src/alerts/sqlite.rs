use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use dispatch_common::AlertRecord;

use super::{AlertStore, AlertStoreError};

/// SQLite-backed alert store.
///
/// Queries run on the blocking pool.
pub struct SqliteAlertStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAlertStore {
    pub fn new(database_url: &str) -> Result<Self, AlertStoreError> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AlertStoreError::IoError(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                image_path TEXT NOT NULL,
                image_url TEXT NOT NULL,
                algorithm_id TEXT NOT NULL,
                algorithm_name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                result TEXT NOT NULL,
                confidence REAL NOT NULL,
                detection_count INTEGER NOT NULL,
                inference_time_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_alerts_created_at ON alerts(created_at)",
            [],
        )
        .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_alerts_task ON alerts(task_type, task_id)",
            [],
        )
        .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?;

        tracing::info!("Alert store initialized with database: {}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, AlertStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AlertStoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?
    }
}

#[async_trait]
impl AlertStore for SqliteAlertStore {
    async fn create(&self, alert: &AlertRecord) -> Result<(), AlertStoreError> {
        let alert = alert.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO alerts (id, task_id, task_type, image_path, image_url, algorithm_id,
                    algorithm_name, endpoint, result, confidence, detection_count, inference_time_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    alert.id,
                    alert.task_id,
                    alert.task_type,
                    alert.image_path,
                    alert.image_url,
                    alert.algorithm_id,
                    alert.algorithm_name,
                    alert.endpoint,
                    alert.result.to_string(),
                    alert.confidence,
                    alert.detection_count as i64,
                    alert.inference_time_ms as i64,
                    alert.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?;

            tracing::debug!("Saved alert {} for {}", alert.id, alert.image_path);
            Ok(())
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AlertRecord>, AlertStoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_id, task_type, image_path, image_url, algorithm_id, algorithm_name,
                        endpoint, result, confidence, detection_count, inference_time_ms, created_at
                     FROM alerts ORDER BY created_at DESC LIMIT ?1",
                )
                .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?;

            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    let result: String = row.get(8)?;
                    let created_at: String = row.get(12)?;
                    Ok(AlertRecord {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        task_type: row.get(2)?,
                        image_path: row.get(3)?,
                        image_url: row.get(4)?,
                        algorithm_id: row.get(5)?,
                        algorithm_name: row.get(6)?,
                        endpoint: row.get(7)?,
                        result: serde_json::from_str(&result).unwrap_or(serde_json::Value::Null),
                        confidence: row.get(9)?,
                        detection_count: row.get::<_, i64>(10)? as u64,
                        inference_time_ms: row.get::<_, i64>(11)? as u64,
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                })
                .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AlertStoreError::DatabaseError(e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(image: &str, detections: usize) -> AlertRecord {
        AlertRecord::new(
            "cam-1".to_string(),
            "helmet".to_string(),
            format!("frames/helmet/cam-1/{}", image),
            format!("http://store/{}", image),
            "yolo".to_string(),
            "YOLO".to_string(),
            "http://a/infer".to_string(),
            json!({"detections": vec![json!({"label": "no_helmet"}); detections]}),
            0.87,
            42,
        )
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let store = SqliteAlertStore::new(":memory:").unwrap();
        let alert = record("a.jpg", 2);
        store.create(&alert).await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, alert.id);
        assert_eq!(recent[0].detection_count, 2);
        assert_eq!(recent[0].result, alert.result);
    }

    #[tokio::test]
    async fn test_recent_respects_limit() {
        let store = SqliteAlertStore::new("sqlite::memory:").unwrap();
        for i in 0..5 {
            store.create(&record(&format!("{}.jpg", i), 1)).await.unwrap();
        }
        assert_eq!(store.recent(3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/alerts.db");
        let url = format!("sqlite:{}", path.display());

        let store = SqliteAlertStore::new(&url).unwrap();
        store.create(&record("a.jpg", 0)).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_all_land() {
        let store = Arc::new(SqliteAlertStore::new(":memory:").unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.create(&record(&format!("{}.jpg", i), 1)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.recent(100).await.unwrap().len(), 8);
    }
}
