//! HTTP protocol types between the dispatcher and algorithm services.
//!
//! Two directions share these types:
//!
//! ## Control plane (algorithm service -> dispatcher)
//!
//! 1. Service POSTs a [`ServiceRegistration`] to `{API_PREFIX}/register`
//! 2. Dispatcher answers with a [`RegisterResponse`]
//! 3. Service POSTs a [`HeartbeatRequest`] to `{API_PREFIX}/heartbeat/{service_id}`
//!    on a fixed interval; a 404 means it was dropped and must register again
//!
//! ## Inference (dispatcher -> algorithm service)
//!
//! The dispatcher POSTs an [`InferenceRequest`] to the registered endpoint and
//! expects an [`InferenceResponse`] back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Path prefix of the dispatcher's control plane.
pub const API_PREFIX: &str = "/api/v1/ai_analysis";

/// Registration sent by an algorithm service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// Logical service identifier. May be shared by several endpoints.
    pub service_id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Task categories this instance can process.
    #[serde(default)]
    pub task_types: Vec<String>,
    /// Inference URL; unique per instance.
    pub endpoint: String,
    #[serde(default)]
    pub version: String,
}

/// Reply to a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub ok: bool,
    pub service_id: String,
}

/// Performance counters reported by the service itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub avg_inference_time_ms: f64,
    #[serde(default)]
    pub last_inference_time_ms: f64,
    #[serde(default)]
    pub last_total_time_ms: f64,
}

/// Heartbeat body. Every field is optional; an empty body is a bare liveness ping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_inference_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_inference_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_total_time_ms: Option<f64>,
}

impl HeartbeatRequest {
    /// Build a heartbeat that carries a full stats report.
    pub fn with_stats(stats: &ServiceStats) -> Self {
        Self {
            total_requests: Some(stats.total_requests),
            avg_inference_time_ms: Some(stats.avg_inference_time_ms),
            last_inference_time_ms: Some(stats.last_inference_time_ms),
            last_total_time_ms: Some(stats.last_total_time_ms),
        }
    }

    /// Stats carried by this heartbeat, if any field was set.
    pub fn stats(&self) -> Option<ServiceStats> {
        if self.total_requests.is_none()
            && self.avg_inference_time_ms.is_none()
            && self.last_inference_time_ms.is_none()
            && self.last_total_time_ms.is_none()
        {
            return None;
        }

        Some(ServiceStats {
            total_requests: self.total_requests.unwrap_or_default(),
            avg_inference_time_ms: self.avg_inference_time_ms.unwrap_or_default(),
            last_inference_time_ms: self.last_inference_time_ms.unwrap_or_default(),
            last_total_time_ms: self.last_total_time_ms.unwrap_or_default(),
        })
    }
}

/// Request body POSTed to an algorithm service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Short-lived signed URL for reading the image.
    pub image_url: String,
    pub task_id: String,
    pub task_type: String,
    /// Object-store key of the image.
    pub image_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algo_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algo_config_url: Option<String>,
}

/// Response expected from an algorithm service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub confidence: f64,
    /// Time the service spent on the computation itself.
    #[serde(default)]
    pub inference_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InferenceResponse {
    /// Build a failed response with the given message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            confidence: 0.0,
            inference_time_ms: 0.0,
            error: Some(message.into()),
        }
    }
}
