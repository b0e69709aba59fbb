//! HTTP-level tests for the control plane.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use chrono::Utc;
use http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use dispatch_server::alerts::{AlertStore, SqliteAlertStore};
use dispatch_server::config::ProducerConfig;
use dispatch_server::dispatch::{
    EvictionStrategy, PendingImage, SchedulerOptions, SystemAlertLog,
};
use dispatch_server::publish::NoopPublisher;
use dispatch_server::store::{LocalObjectStore, MemoryObjectStore, ObjectStore, UrlSigner};
use dispatch_server::{
    routes, AlgorithmRegistry, AppState, Config, DispatchHandles, InferenceQueue, PerformanceMonitor,
    Pipeline, Producer, Scheduler,
};

const PREFIX: &str = "/api/v1/ai_analysis";

struct TestApp {
    app: Router,
    state: Arc<AppState>,
}

fn bare_app() -> TestApp {
    let registry = Arc::new(AlgorithmRegistry::new(Duration::from_secs(90)));
    let state = Arc::new(AppState::new(Config::default(), registry));
    TestApp {
        app: routes::app(state.clone()),
        state,
    }
}

fn running_app() -> (TestApp, Arc<InferenceQueue>, Arc<PerformanceMonitor>) {
    let TestApp { state, .. } = bare_app();
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    let alert_store: Arc<dyn AlertStore> = Arc::new(SqliteAlertStore::new(":memory:").unwrap());
    let queue = Arc::new(InferenceQueue::new(2, EvictionStrategy::DropOldest));
    let monitor = Arc::new(PerformanceMonitor::new(5000));
    let scheduler = Arc::new(
        Scheduler::new(
            state.registry.clone(),
            monitor.clone(),
            store.clone(),
            alert_store.clone(),
            Arc::new(NoopPublisher),
            SchedulerOptions::default(),
        )
        .unwrap(),
    );
    let producer = Arc::new(Producer::new(&ProducerConfig::default(), store, queue.clone()));

    assert!(state.install(DispatchHandles {
        pipeline: Arc::new(Pipeline::new(queue.clone(), monitor.clone(), scheduler)),
        alert_store,
        system_alerts: Arc::new(SystemAlertLog::new()),
        producer,
    }));

    (
        TestApp {
            app: routes::app(state.clone()),
            state,
        },
        queue,
        monitor,
    )
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header("Content-Type", "application/json");
    }
    let req = builder
        .body(match body {
            Some(b) => Body::from(b.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn registration(id: &str, endpoint: &str) -> Value {
    json!({
        "service_id": id,
        "name": "Helmet detector",
        "task_types": ["helmet"],
        "endpoint": endpoint,
        "version": "1.0.0"
    })
}

fn image(name: &str) -> PendingImage {
    PendingImage {
        path: format!("frames/helmet/cam-1/{}", name),
        task_type: "helmet".to_string(),
        task_id: "cam-1".to_string(),
        filename: name.to_string(),
        size: 1,
        modified_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_health() {
    let t = bare_app();
    let (status, body) = send(&t.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["registered_services"], 0);
}

#[tokio::test]
async fn test_register_and_list_services() {
    let t = bare_app();
    let (status, body) = send(
        &t.app,
        Method::POST,
        &format!("{}/register", PREFIX),
        Some(registration("yolo", "http://10.0.0.5:9000/infer")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "service_id": "yolo"}));

    let (status, body) = send(&t.app, Method::GET, &format!("{}/services", PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["services"][0]["endpoint"], "http://10.0.0.5:9000/infer");
    assert_eq!(body["services"][0]["call_count"], 0);
}

#[tokio::test]
async fn test_register_validation() {
    let t = bare_app();
    let (status, body) = send(
        &t.app,
        Method::POST,
        &format!("{}/register", PREFIX),
        Some(json!({"service_id": "yolo", "task_types": [], "endpoint": "http://a"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "validation_error");

    let (status, _) = send(
        &t.app,
        Method::POST,
        &format!("{}/register", PREFIX),
        Some(json!({"name": "missing fields"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_heartbeat_by_id_and_endpoint() {
    let t = bare_app();
    let endpoint = "http://10.0.0.5:9000/infer";
    send(
        &t.app,
        Method::POST,
        &format!("{}/register", PREFIX),
        Some(registration("yolo", endpoint)),
    )
    .await;

    let (status, _) = send(
        &t.app,
        Method::POST,
        &format!("{}/heartbeat/yolo", PREFIX),
        Some(json!({"total_requests": 12, "avg_inference_time_ms": 40.5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let services = t.state.registry.list_instances().await;
    assert_eq!(services[0].instance.stats.total_requests, 12);

    let encoded = "http%3A%2F%2F10.0.0.5%3A9000%2Finfer";
    let (status, body) = send(
        &t.app,
        Method::POST,
        &format!("{}/heartbeat/{}", PREFIX, encoded),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matched"], 1);

    let (status, body) = send(&t.app, Method::POST, &format!("{}/heartbeat/ghost", PREFIX), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found");
}

#[tokio::test]
async fn test_unregister() {
    let t = bare_app();
    send(
        &t.app,
        Method::POST,
        &format!("{}/register", PREFIX),
        Some(registration("yolo", "http://a/infer")),
    )
    .await;

    let (status, _) = send(&t.app, Method::DELETE, &format!("{}/unregister/yolo", PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&t.app, Method::DELETE, &format!("{}/unregister/yolo", PREFIX), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_load_balance_and_clear_all() {
    let t = bare_app();
    for (id, endpoint) in [("a", "http://a/infer"), ("b", "http://b/infer")] {
        send(
            &t.app,
            Method::POST,
            &format!("{}/register", PREFIX),
            Some(registration(id, endpoint)),
        )
        .await;
    }

    let (_, body) = send(&t.app, Method::GET, &format!("{}/load_balance", PREFIX), None).await;
    assert_eq!(body["categories"][0]["category"], "helmet");
    assert_eq!(body["categories"][0]["total_weight"], 20);

    let (_, body) = send(&t.app, Method::POST, &format!("{}/clear_all", PREFIX), None).await;
    assert_eq!(body["cleared"], 2);
    assert_eq!(t.state.registry.count().await, 0);
}

#[tokio::test]
async fn test_dispatch_endpoints_unavailable_before_install() {
    let t = bare_app();
    for (method, path) in [
        (Method::GET, "/stats"),
        (Method::POST, "/queue/reset"),
        (Method::POST, "/stats/reset"),
        (Method::GET, "/sampling_rate?frame_interval_ms=40"),
        (Method::GET, "/alerts"),
        (Method::GET, "/system_alerts"),
    ] {
        let (status, body) = send(&t.app, method, &format!("{}{}", PREFIX, path), None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", path);
        assert_eq!(body["error"]["type"], "not_ready");
    }
}

#[tokio::test]
async fn test_stats_and_queue_reset() {
    let (t, queue, monitor) = running_app();
    queue
        .add(vec![image("a.jpg"), image("b.jpg"), image("c.jpg")])
        .await;
    monitor.record_inference(100, true);

    let (status, body) = send(&t.app, Method::GET, &format!("{}/stats", PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue"]["queue_size"], 2);
    assert_eq!(body["queue"]["dropped_total"], 1);
    assert_eq!(body["queue"]["strategy"], "drop_oldest");
    assert_eq!(body["performance"]["success_count"], 1);
    assert_eq!(body["drop_rate"], 1.0);
    assert_eq!(body["healthy"], false);
    assert_eq!(body["active_inferences"], 0);
    assert_eq!(body["max_concurrent"], 5);
    assert_eq!(body["producer_healthy"], true);

    let (status, body) = send(&t.app, Method::POST, &format!("{}/queue/reset", PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "cleared": 2}));

    let (status, _) = send(&t.app, Method::POST, &format!("{}/stats/reset", PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(monitor.stats().total_count, 0);
}

#[tokio::test]
async fn test_sampling_rate() {
    let (t, _, monitor) = running_app();
    for _ in 0..10 {
        monitor.record_inference(200, true);
    }

    let (status, body) = send(
        &t.app,
        Method::GET,
        &format!("{}/sampling_rate?frame_interval_ms=100", PREFIX),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sampling_rate"], 2);

    let (status, _) = send(
        &t.app,
        Method::GET,
        &format!("{}/sampling_rate?frame_interval_ms=0", PREFIX),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_alert_listings() {
    let (t, _, _) = running_app();
    let (status, body) = send(&t.app, Method::GET, &format!("{}/alerts?limit=5", PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alerts"], json!([]));

    let (status, body) = send(&t.app, Method::GET, &format!("{}/system_alerts", PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alerts"], json!([]));
}

#[tokio::test]
async fn test_signed_object_reads() {
    let dir = tempfile::tempdir().unwrap();
    let frame = dir.path().join("frames/helmet/cam-1");
    std::fs::create_dir_all(&frame).unwrap();
    std::fs::write(frame.join("a.jpg"), b"jpeg-bytes").unwrap();

    let objects = Arc::new(
        LocalObjectStore::new(
            dir.path(),
            "http://dispatch.local",
            UrlSigner::new("secret"),
            Duration::from_secs(1),
        )
        .unwrap(),
    );
    let registry = Arc::new(AlgorithmRegistry::new(Duration::from_secs(90)));
    let state = Arc::new(AppState::new(Config::default(), registry).with_objects(objects.clone()));
    let app = routes::app(state);

    let url = objects
        .presign_get("frames/helmet/cam-1/a.jpg", Duration::from_secs(60))
        .await
        .unwrap();
    let path = url.strip_prefix("http://dispatch.local").unwrap();

    let response = app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/jpeg");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"jpeg-bytes");

    let tampered = path.replace("a.jpg", "b.jpg");
    let (status, _) = send(&app, Method::GET, &tampered, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let expired = format!(
        "/objects/frames/helmet/cam-1/a.jpg?expires=1&signature={}",
        UrlSigner::new("secret").sign("frames/helmet/cam-1/a.jpg", 1)
    );
    let (status, _) = send(&app, Method::GET, &expired, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let expires = Utc::now().timestamp() + 60;
    let missing = format!(
        "/objects/frames/helmet/cam-1/gone.jpg?expires={}&signature={}",
        expires,
        UrlSigner::new("secret").sign("frames/helmet/cam-1/gone.jpg", expires)
    );
    let (status, _) = send(&app, Method::GET, &missing, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
