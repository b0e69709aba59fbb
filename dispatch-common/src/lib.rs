//! frame-dispatch Common Types
//!
//! Shared types used by both the dispatch server and algorithm services.

pub mod alert;
pub mod protocol;

pub use alert::{detection_count, AlertRecord};
pub use protocol::{
    HeartbeatRequest, InferenceRequest, InferenceResponse, RegisterResponse, ServiceRegistration,
    ServiceStats, API_PREFIX,
};
