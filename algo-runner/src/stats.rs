//! Self-reported performance counters sent with heartbeats.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dispatch_common::ServiceStats;

/// Number of recent inferences averaged.
pub const STATS_WINDOW: usize = 50;

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    inference_times: VecDeque<f64>,
    last_inference_ms: f64,
    last_total_ms: f64,
}

#[derive(Debug, Default)]
pub struct StatsTracker {
    counters: Mutex<Counters>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, inference_ms: f64, total_ms: f64) {
        let mut counters = self.counters();
        counters.total_requests += 1;
        counters.last_inference_ms = inference_ms;
        counters.last_total_ms = total_ms;
        if counters.inference_times.len() == STATS_WINDOW {
            counters.inference_times.pop_front();
        }
        counters.inference_times.push_back(inference_ms);
    }

    pub fn snapshot(&self) -> ServiceStats {
        let counters = self.counters();
        let avg = if counters.inference_times.is_empty() {
            0.0
        } else {
            counters.inference_times.iter().sum::<f64>() / counters.inference_times.len() as f64
        };
        ServiceStats {
            total_requests: counters.total_requests,
            avg_inference_time_ms: round2(avg),
            last_inference_time_ms: round2(counters.last_inference_ms),
            last_total_time_ms: round2(counters.last_total_ms),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        assert_eq!(StatsTracker::new().snapshot(), ServiceStats::default());
    }

    #[test]
    fn test_average_over_window() {
        let stats = StatsTracker::new();
        for _ in 0..STATS_WINDOW {
            stats.record(10.0, 12.0);
        }
        stats.record(60.0, 70.0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 51);
        assert_eq!(snapshot.avg_inference_time_ms, 11.0);
        assert_eq!(snapshot.last_inference_time_ms, 60.0);
        assert_eq!(snapshot.last_total_time_ms, 70.0);
    }
}
