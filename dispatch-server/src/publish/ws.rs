//! Alert publisher pushing JSON text frames over a WebSocket.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use dispatch_common::AlertRecord;

use super::{AlertPublisher, PublishError};

/// Buffers alerts and forwards them to a broker endpoint, reconnecting as needed.
///
/// Alerts published while the connection is down stay in the buffer until it
/// fills up; after that they are rejected with [`PublishError::Backpressure`].
pub struct WebSocketPublisher {
    tx: mpsc::Sender<String>,
}

impl WebSocketPublisher {
    pub fn spawn(
        url: String,
        buffer: usize,
        reconnect_delay: Duration,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(run(url, rx, reconnect_delay, cancel));
        (Self { tx }, handle)
    }
}

#[async_trait]
impl AlertPublisher for WebSocketPublisher {
    async fn publish(&self, alert: &AlertRecord) -> Result<(), PublishError> {
        let payload = serde_json::to_string(alert)?;
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::Backpressure(alert.id.clone()),
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }
}

async fn run(
    url: String,
    mut rx: mpsc::Receiver<String>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    // A frame that failed mid-send is retried on the next connection.
    let mut pending: Option<String> = None;

    loop {
        tracing::info!("Connecting to alert broker at {}", url);

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_and_forward(&url, &mut rx, &mut pending) => match result {
                Ok(()) => {
                    tracing::info!("Alert publisher channel closed");
                    break;
                }
                Err(e) => tracing::error!("Alert broker connection error: {}", e),
            },
        }

        tracing::info!("Reconnecting to alert broker in {:?}", reconnect_delay);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    tracing::info!("Alert publisher stopped");
}

async fn connect_and_forward(
    url: &str,
    rx: &mut mpsc::Receiver<String>,
    pending: &mut Option<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();
    tracing::info!("Connected to alert broker");

    if let Some(payload) = pending.take() {
        if let Err(e) = write.send(Message::Text(payload.clone())).await {
            *pending = Some(payload);
            return Err(e.into());
        }
    }

    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Some(payload) = payload else {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                };
                if let Err(e) = write.send(Message::Text(payload.clone())).await {
                    *pending = Some(payload);
                    return Err(e.into());
                }
            }

            incoming = read.next() => match incoming {
                Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => {
                    return Err("broker closed the connection".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::NoopPublisher;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn alert() -> AlertRecord {
        AlertRecord::new(
            "cam-1".to_string(),
            "helmet".to_string(),
            "frames/helmet/cam-1/a.jpg".to_string(),
            "http://store/a.jpg".to_string(),
            "yolo".to_string(),
            "YOLO".to_string(),
            "http://a/infer".to_string(),
            json!({"count": 1}),
            0.9,
            12,
        )
    }

    #[tokio::test]
    async fn test_publishes_json_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => return text,
                    _ => continue,
                }
            }
        });

        let cancel = CancellationToken::new();
        let (publisher, handle) = WebSocketPublisher::spawn(
            format!("ws://{}", addr),
            8,
            Duration::from_millis(50),
            cancel.clone(),
        );
        let record = alert();
        publisher.publish(&record).await.unwrap();

        let text = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        let received: AlertRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(received.id, record.id);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_buffer_reports_backpressure() {
        let cancel = CancellationToken::new();
        // Nothing listens there, so the buffer never drains.
        let (publisher, handle) = WebSocketPublisher::spawn(
            "ws://127.0.0.1:9".to_string(),
            1,
            Duration::from_secs(60),
            cancel.clone(),
        );

        publisher.publish(&alert()).await.unwrap();
        let result = publisher.publish(&alert()).await;
        assert!(matches!(result, Err(PublishError::Backpressure(_))));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_closed() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (publisher, handle) = WebSocketPublisher::spawn(
            "ws://127.0.0.1:9".to_string(),
            1,
            Duration::from_secs(60),
            cancel,
        );
        handle.await.unwrap();

        let result = publisher.publish(&alert()).await;
        assert!(matches!(result, Err(PublishError::Closed)));
    }

    #[tokio::test]
    async fn test_noop_publisher_accepts() {
        assert!(NoopPublisher.publish(&alert()).await.is_ok());
    }
}
