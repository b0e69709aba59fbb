//! Images waiting for dispatch.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A newly discovered image, parsed from a `<base>/<task_type>/<task_id>/<filename>` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingImage {
    /// Full object-store key.
    pub path: String,
    pub task_type: String,
    pub task_id: String,
    pub filename: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}
