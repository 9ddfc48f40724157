mod filter;
mod scheduler;

pub use filter::{DriftFilter, DEFAULT_ERROR_COVARIANCE};
pub use scheduler::{
    drift_seconds, RefreshScheduler, SchedulerConfig, DEFAULT_MEASUREMENT_NOISE,
    DEFAULT_PROCESS_NOISE, DRIFT_WARN_SECONDS,
};
