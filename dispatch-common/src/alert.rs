//! Alert records produced from successful inference results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One successful inference result, as persisted and published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub task_id: String,
    pub task_type: String,
    pub image_path: String,
    pub image_url: String,
    /// Service id of the algorithm that produced the result.
    pub algorithm_id: String,
    pub algorithm_name: String,
    pub endpoint: String,
    /// Raw result payload returned by the algorithm.
    pub result: Value,
    pub confidence: f64,
    pub detection_count: u64,
    pub inference_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl AlertRecord {
    /// Create a record with a fresh id and the detection count derived from `result`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        task_type: String,
        image_path: String,
        image_url: String,
        algorithm_id: String,
        algorithm_name: String,
        endpoint: String,
        result: Value,
        confidence: f64,
        inference_time_ms: u64,
    ) -> Self {
        let detection_count = detection_count(&result);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id,
            task_type,
            image_path,
            image_url,
            algorithm_id,
            algorithm_name,
            endpoint,
            result,
            confidence,
            detection_count,
            inference_time_ms,
            created_at: Utc::now(),
        }
    }
}

/// Extract the number of detections from an algorithm result payload.
///
/// Looks, in order, at the summed `line_crossing.<region>.count` values (when
/// positive), `total_count`, `count`, `num`, and finally the length of a
/// `detections` or `objects` array. Anything else counts as zero.
pub fn detection_count(result: &Value) -> u64 {
    let Some(map) = result.as_object() else {
        return 0;
    };

    if let Some(regions) = map.get("line_crossing").and_then(Value::as_object) {
        let crossings: u64 = regions
            .values()
            .filter_map(|region| region.get("count"))
            .filter_map(as_count)
            .sum();
        if crossings > 0 {
            return crossings;
        }
    }

    for key in ["total_count", "count", "num"] {
        if let Some(n) = map.get(key).and_then(as_count) {
            return n;
        }
    }

    for key in ["detections", "objects"] {
        if let Some(items) = map.get(key).and_then(Value::as_array) {
            return items.len() as u64;
        }
    }

    0
}

fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| if f > 0.0 { f as u64 } else { 0 }))
}
