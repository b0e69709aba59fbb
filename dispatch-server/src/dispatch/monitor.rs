//! Process-wide inference latency and throughput tracking.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use super::system_alert::{AlertLevel, SystemAlert, SystemAlertKind, SystemAlertSender};

const RATE_WINDOW: Duration = Duration::from_secs(60);
const SLOW_ALERT_INTERVAL: Duration = Duration::from_secs(60);
/// Successful samples needed before sampling advice departs from 1.
const MIN_SAMPLES_FOR_SAMPLING: u64 = 10;
const MAX_SAMPLING_STRIDE: u32 = 100;

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub total_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub avg_inference_ms: f64,
    pub max_inference_ms: u64,
    pub inferences_per_min: f64,
    pub inference_per_sec: f64,
    pub slow_count: u64,
    pub slow_threshold_ms: u64,
}

#[derive(Debug)]
struct MonitorState {
    success_count: u64,
    failed_count: u64,
    total_time_ms: u64,
    max_time_ms: u64,
    slow_count: u64,
    window_start: Instant,
    window_count: u64,
    rate_per_min: f64,
    last_slow_alert: Option<Instant>,
}

impl MonitorState {
    fn new(now: Instant) -> Self {
        Self {
            success_count: 0,
            failed_count: 0,
            total_time_ms: 0,
            max_time_ms: 0,
            slow_count: 0,
            window_start: now,
            window_count: 0,
            rate_per_min: 0.0,
            last_slow_alert: None,
        }
    }

    fn avg_ms(&self) -> f64 {
        if self.success_count == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.success_count as f64
        }
    }
}

/// Rolling inference statistics and adaptive sampling advice.
#[derive(Debug)]
pub struct PerformanceMonitor {
    slow_threshold_ms: u64,
    state: Mutex<MonitorState>,
    alerts: Option<SystemAlertSender>,
}

impl PerformanceMonitor {
    pub fn new(slow_threshold_ms: u64) -> Self {
        Self {
            slow_threshold_ms,
            state: Mutex::new(MonitorState::new(Instant::now())),
            alerts: None,
        }
    }

    pub fn with_alerts(mut self, alerts: SystemAlertSender) -> Self {
        self.alerts = Some(alerts);
        self
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one inference outcome.
    pub fn record_inference(&self, elapsed_ms: u64, success: bool) {
        let alert = {
            let mut state = self.state();
            if !success {
                state.failed_count += 1;
                return;
            }

            let now = Instant::now();
            state.success_count += 1;
            state.total_time_ms += elapsed_ms;
            state.max_time_ms = state.max_time_ms.max(elapsed_ms);
            state.window_count += 1;

            let window = now.duration_since(state.window_start);
            if window >= RATE_WINDOW {
                state.rate_per_min = state.window_count as f64 / (window.as_secs_f64() / 60.0);
                state.window_start = now;
                state.window_count = 0;
            }

            if elapsed_ms > self.slow_threshold_ms {
                state.slow_count += 1;
                let due = state
                    .last_slow_alert
                    .map_or(true, |last| now.duration_since(last) >= SLOW_ALERT_INTERVAL);
                if due {
                    state.last_slow_alert = Some(now);
                    Some(SystemAlert::new(
                        SystemAlertKind::SlowInference,
                        AlertLevel::Warning,
                        format!(
                            "Slow inference: {}ms (threshold {}ms, avg {:.0}ms)",
                            elapsed_ms,
                            self.slow_threshold_ms,
                            state.avg_ms()
                        ),
                        json!({
                            "inference_ms": elapsed_ms,
                            "threshold_ms": self.slow_threshold_ms,
                            "avg_inference_ms": state.avg_ms(),
                            "slow_count": state.slow_count,
                        }),
                    ))
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let (Some(alert), Some(alerts)) = (alert, &self.alerts) {
            let _ = alerts.send(alert);
        }
    }

    /// Recommended "process every k-th frame" stride for a stream with the
    /// given frame interval.
    pub fn calculate_sampling_rate(&self, frame_interval_ms: f64) -> u32 {
        let state = self.state();
        let avg_ms = state.avg_ms();
        if state.success_count < MIN_SAMPLES_FOR_SAMPLING || avg_ms <= 0.0 || frame_interval_ms <= 0.0 {
            return 1;
        }

        let frames_per_sec = 1000.0 / frame_interval_ms;
        let infer_per_sec = 1000.0 / avg_ms;
        if infer_per_sec >= 0.9 * frames_per_sec {
            return 1;
        }

        let stride = (frames_per_sec / infer_per_sec).ceil();
        (stride as u32).clamp(1, MAX_SAMPLING_STRIDE)
    }

    pub fn avg_inference_ms(&self) -> f64 {
        self.state().avg_ms()
    }

    pub fn stats(&self) -> PerformanceStats {
        let state = self.state();
        PerformanceStats {
            total_count: state.success_count + state.failed_count,
            success_count: state.success_count,
            failed_count: state.failed_count,
            avg_inference_ms: state.avg_ms(),
            max_inference_ms: state.max_time_ms,
            inferences_per_min: state.rate_per_min,
            inference_per_sec: state.rate_per_min / 60.0,
            slow_count: state.slow_count,
            slow_threshold_ms: self.slow_threshold_ms,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        *self.state() = MonitorState::new(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::system_alert::system_alert_channel;

    #[test]
    fn test_failure_only_counts_failure() {
        let monitor = PerformanceMonitor::new(5000);
        monitor.record_inference(9000, false);

        let stats = monitor.stats();
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.max_inference_ms, 0);
        assert_eq!(stats.slow_count, 0);
    }

    #[test]
    fn test_success_updates_latency() {
        let monitor = PerformanceMonitor::new(5000);
        monitor.record_inference(100, true);
        monitor.record_inference(300, true);

        let stats = monitor.stats();
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.avg_inference_ms, 200.0);
        assert_eq!(stats.max_inference_ms, 300);
    }

    #[test]
    fn test_sampling_rate_needs_samples() {
        let monitor = PerformanceMonitor::new(5000);
        for _ in 0..9 {
            monitor.record_inference(1000, true);
        }
        assert_eq!(monitor.calculate_sampling_rate(40.0), 1);
    }

    #[test]
    fn test_sampling_rate_stride() {
        let monitor = PerformanceMonitor::new(5000);
        for _ in 0..10 {
            monitor.record_inference(200, true);
        }
        assert_eq!(monitor.calculate_sampling_rate(100.0), 2);
        assert_eq!(monitor.calculate_sampling_rate(40.0), 5);
    }

    #[test]
    fn test_sampling_rate_when_keeping_up() {
        let monitor = PerformanceMonitor::new(5000);
        for _ in 0..10 {
            monitor.record_inference(95, true);
        }
        assert_eq!(monitor.calculate_sampling_rate(100.0), 1);
    }

    #[test]
    fn test_sampling_rate_is_capped() {
        let monitor = PerformanceMonitor::new(60_000);
        for _ in 0..10 {
            monitor.record_inference(50_000, true);
        }
        assert_eq!(monitor.calculate_sampling_rate(10.0), MAX_SAMPLING_STRIDE);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let monitor = PerformanceMonitor::new(100);
        monitor.record_inference(500, true);
        monitor.record_inference(5, false);
        monitor.reset();

        let stats = monitor.stats();
        assert_eq!(stats.total_count, 0);
        assert_eq!(stats.slow_count, 0);
        assert_eq!(stats.avg_inference_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_alert_is_rate_limited() {
        let alerts = system_alert_channel();
        let mut rx = alerts.subscribe();
        let monitor = PerformanceMonitor::new(1000).with_alerts(alerts);

        monitor.record_inference(1500, true);
        monitor.record_inference(2500, true);
        assert_eq!(rx.try_recv().unwrap().kind, SystemAlertKind::SlowInference);
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.stats().slow_count, 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        monitor.record_inference(1200, true);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_window() {
        let monitor = PerformanceMonitor::new(5000);
        for _ in 0..29 {
            monitor.record_inference(50, true);
        }
        assert_eq!(monitor.stats().inferences_per_min, 0.0);

        tokio::time::advance(Duration::from_secs(60)).await;
        monitor.record_inference(50, true);

        let stats = monitor.stats();
        assert!((stats.inferences_per_min - 30.0).abs() < 1e-6);
        assert!((stats.inference_per_sec - 0.5).abs() < 1e-6);
    }
}
