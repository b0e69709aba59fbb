//! Algorithm runner for frame-dispatch.
//!
//! Serves the inference protocol on `POST /infer` and keeps itself registered
//! with the dispatcher through register and heartbeat calls.

pub mod api;
pub mod config;
pub mod control;
pub mod detector;
pub mod error;
pub mod logging;
pub mod state;
pub mod stats;

pub use config::Config;
pub use control::{ControlError, ControlPlaneClient};
pub use detector::{Detector, ProbeDetector};
pub use state::AppState;
pub use stats::StatsTracker;
