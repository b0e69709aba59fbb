//! Core dispatch pipeline: registry, queue, scheduler and monitor.

mod monitor;
mod pending;
mod queue;
mod registry;
mod scheduler;
mod system_alert;
mod worker;

pub use monitor::{PerformanceMonitor, PerformanceStats};
pub use pending::PendingImage;
pub use queue::{drop_rate, EvictionStrategy, InferenceQueue, QueueStats};
pub use registry::{
    AlgorithmInstance, AlgorithmRegistry, BalanceEntry, CategoryBalance, InstanceKey, InstanceSummary,
    RegistryError, RegistryEvent, UnregisterReason,
};
pub use scheduler::{DispatchError, DispatchSummary, Scheduler, SchedulerOptions};
pub use system_alert::{
    system_alert_channel, AlertLevel, SystemAlert, SystemAlertKind, SystemAlertLog, SystemAlertSender,
};
pub use worker::{spawn_stats_logger, spawn_workers};

use std::sync::Arc;

use serde::Serialize;

/// Drop rate above which the pipeline reports itself unhealthy.
pub const UNHEALTHY_DROP_RATE: f64 = 0.3;
/// Average inference time (ms) above which the pipeline reports itself unhealthy.
pub const UNHEALTHY_AVG_INFERENCE_MS: f64 = 3000.0;

/// Snapshot served by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub queue: QueueStats,
    pub performance: PerformanceStats,
    pub drop_rate: f64,
    pub healthy: bool,
}

impl DispatchStats {
    pub fn new(queue: QueueStats, performance: PerformanceStats) -> Self {
        let drop_rate = drop_rate(queue.dropped_total, queue.processed_total);
        let healthy =
            drop_rate <= UNHEALTHY_DROP_RATE && performance.avg_inference_ms <= UNHEALTHY_AVG_INFERENCE_MS;
        Self {
            queue,
            performance,
            drop_rate,
            healthy,
        }
    }
}

/// The queue, scheduler and monitor wired together.
pub struct Pipeline {
    pub queue: Arc<InferenceQueue>,
    pub monitor: Arc<PerformanceMonitor>,
    pub scheduler: Arc<Scheduler>,
}

impl Pipeline {
    pub fn new(queue: Arc<InferenceQueue>, monitor: Arc<PerformanceMonitor>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            queue,
            monitor,
            scheduler,
        }
    }

    pub async fn stats(&self) -> DispatchStats {
        DispatchStats::new(self.queue.stats().await, self.monitor.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_stats(dropped: u64, processed: u64) -> QueueStats {
        QueueStats {
            queue_size: 0,
            max_size: 10,
            dropped_total: dropped,
            processed_total: processed,
            utilization: 0.0,
            strategy: EvictionStrategy::DropOldest,
        }
    }

    fn perf_stats(avg: f64) -> PerformanceStats {
        PerformanceStats {
            total_count: 0,
            success_count: 0,
            failed_count: 0,
            avg_inference_ms: avg,
            max_inference_ms: 0,
            inferences_per_min: 0.0,
            inference_per_sec: 0.0,
            slow_count: 0,
            slow_threshold_ms: 5000,
        }
    }

    #[test]
    fn test_healthy_when_idle() {
        let stats = DispatchStats::new(queue_stats(0, 0), perf_stats(0.0));
        assert_eq!(stats.drop_rate, 0.0);
        assert!(stats.healthy);
    }

    #[test]
    fn test_unhealthy_on_drop_rate() {
        let stats = DispatchStats::new(queue_stats(4, 6), perf_stats(100.0));
        assert!((stats.drop_rate - 0.4).abs() < 1e-9);
        assert!(!stats.healthy);

        // Exactly at the limit is still healthy
        assert!(DispatchStats::new(queue_stats(3, 7), perf_stats(100.0)).healthy);
    }

    #[test]
    fn test_unhealthy_on_slow_inference() {
        assert!(!DispatchStats::new(queue_stats(0, 10), perf_stats(3000.5)).healthy);
        assert!(DispatchStats::new(queue_stats(0, 10), perf_stats(3000.0)).healthy);
    }
}
