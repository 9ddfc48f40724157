//! Refresh scheduler
//!
//! Keeps cycle completion aligned to a fixed second of the minute. Each call
//! measures how far the completion landed from the target second, smooths
//! that drift through a `DriftFilter`, and subtracts the smoothed correction
//! from the time left in the interval.
//!
//! A scheduler only works when the same instance sees every cycle: the
//! filter's history is what keeps the correction from chasing per-cycle
//! noise.

use super::filter::DriftFilter;
use chrono::Timelike;
use tracing::{debug, warn};

/// Drift magnitude, in seconds, above which a cycle is reported as late.
pub const DRIFT_WARN_SECONDS: i32 = 3;

pub const DEFAULT_PROCESS_NOISE: f64 = 0.1;
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub update_interval_secs: u32,
    /// Second of the minute (0-59) at which cycles should complete.
    pub target_second: u32,
    pub process_noise: f64,
    pub measurement_noise: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            update_interval_secs: 60,
            target_second: 0,
            process_noise: DEFAULT_PROCESS_NOISE,
            measurement_noise: DEFAULT_MEASUREMENT_NOISE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    config: SchedulerConfig,
    filter: DriftFilter,
}

/// Shortest signed distance on the 60 second wheel from `target` to
/// `second`. Positive means the cycle finished after the target.
pub fn drift_seconds(second: u32, target: u32) -> i32 {
    let raw = second as i32 - (target % 60) as i32;
    (raw + 30).rem_euclid(60) - 30
}

impl RefreshScheduler {
    pub fn new(config: SchedulerConfig) -> RefreshScheduler {
        let config = SchedulerConfig {
            target_second: config.target_second % 60,
            ..config
        };
        RefreshScheduler {
            filter: DriftFilter::new(0.0, config.process_noise, config.measurement_noise),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current smoothed correction, in seconds.
    pub fn correction(&self) -> f64 {
        self.filter.estimate()
    }

    /// Returns `(sleep_seconds, drift_seconds)` for a cycle that took
    /// `elapsed_secs` and completed at `now`.
    ///
    /// `sleep_seconds` is never negative; `drift_seconds` is in `[-30, 30)`.
    pub fn calculate_sleep_time<T: Timelike>(&mut self, elapsed_secs: f64, now: &T) -> (f64, i32) {
        let drift = drift_seconds(now.second(), self.config.target_second);
        let correction = self.filter.update(drift as f64);

        let interval = self.config.update_interval_secs as f64;
        let sleep = (interval - elapsed_secs - correction).max(0.0);

        if drift.abs() > DRIFT_WARN_SECONDS {
            warn!(drift, "update timing gap is large");
        }
        debug!(
            elapsed = elapsed_secs,
            drift,
            correction,
            sleep,
            "scheduled next refresh"
        );
        (sleep, drift)
    }
}
