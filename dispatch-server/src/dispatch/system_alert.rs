//! Operational alerts raised by the dispatch subsystem itself.
//!
//! Components publish on a shared broadcast channel so that raising an
//! alert never blocks the caller and never runs foreign code under a lock.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Kind of operational alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAlertKind {
    QueueBacklog,
    SlowInference,
    HighDropRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemAlert {
    pub kind: SystemAlertKind,
    pub level: AlertLevel,
    pub message: String,
    /// Numbers behind the alert (queue size, latency, ...).
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl SystemAlert {
    pub fn new(kind: SystemAlertKind, level: AlertLevel, message: String, data: Value) -> Self {
        Self {
            kind,
            level,
            message,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Sender half handed to components that raise alerts.
pub type SystemAlertSender = broadcast::Sender<SystemAlert>;

const SYSTEM_ALERT_CHANNEL_CAPACITY: usize = 64;
const RECENT_ALERTS: usize = 100;

/// Create the shared alert channel.
pub fn system_alert_channel() -> SystemAlertSender {
    let (tx, _) = broadcast::channel(SYSTEM_ALERT_CHANNEL_CAPACITY);
    tx
}

/// Keeps the most recent system alerts for the control plane.
#[derive(Debug, Default)]
pub struct SystemAlertLog {
    recent: RwLock<VecDeque<SystemAlert>>,
}

impl SystemAlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, alert: SystemAlert) {
        let mut recent = self.recent.write().await;
        if recent.len() == RECENT_ALERTS {
            recent.pop_front();
        }
        recent.push_back(alert);
    }

    /// Most recent first.
    pub async fn recent(&self) -> Vec<SystemAlert> {
        self.recent.read().await.iter().rev().cloned().collect()
    }

    /// Spawn a task that logs every alert on the channel and records it.
    pub fn spawn_collector(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<SystemAlert>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(alert) => {
                            match alert.level {
                                AlertLevel::Error => tracing::error!(kind = ?alert.kind, "{}", alert.message),
                                AlertLevel::Warning => tracing::warn!(kind = ?alert.kind, "{}", alert.message),
                                AlertLevel::Info => tracing::info!(kind = ?alert.kind, "{}", alert.message),
                            }
                            self.push(alert).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("System alert collector lagged, skipped {} alerts", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_keeps_most_recent_first() {
        let log = SystemAlertLog::new();
        for i in 0..3 {
            log.push(SystemAlert::new(
                SystemAlertKind::QueueBacklog,
                AlertLevel::Warning,
                format!("backlog {}", i),
                json!({}),
            ))
            .await;
        }

        let recent = log.recent().await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "backlog 2");
    }

    #[tokio::test]
    async fn test_log_is_bounded() {
        let log = SystemAlertLog::new();
        for i in 0..(RECENT_ALERTS + 5) {
            log.push(SystemAlert::new(
                SystemAlertKind::SlowInference,
                AlertLevel::Warning,
                format!("slow {}", i),
                json!({}),
            ))
            .await;
        }
        assert_eq!(log.recent().await.len(), RECENT_ALERTS);
    }

    #[tokio::test]
    async fn test_collector_records_sent_alerts() {
        let log = Arc::new(SystemAlertLog::new());
        let tx = system_alert_channel();
        let cancel = CancellationToken::new();
        let handle = log.clone().spawn_collector(tx.subscribe(), cancel.clone());

        tx.send(SystemAlert::new(
            SystemAlertKind::HighDropRate,
            AlertLevel::Error,
            "drop rate 45%".to_string(),
            json!({"drop_rate": 0.45}),
        ))
        .unwrap();

        for _ in 0..50 {
            if !log.recent().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let recent = log.recent().await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, SystemAlertKind::HighDropRate);
    }
}
