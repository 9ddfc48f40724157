//! Drift filter
//!
//! Scalar Kalman-style estimator used to smooth the per-cycle clock drift
//! before it is turned into a sleep correction. The model is a random walk:
//! the predicted covariance grows by the process noise each step, and the
//! gain weighs the new measurement against the prior estimate.

/// Default initial error covariance.
pub const DEFAULT_ERROR_COVARIANCE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct DriftFilter {
    estimate: f64,
    error_covariance: f64,
    process_noise: f64,
    measurement_noise: f64,
}

impl DriftFilter {
    /// Creates a filter starting at `initial_estimate` with the default
    /// error covariance.
    pub fn new(initial_estimate: f64, process_noise: f64, measurement_noise: f64) -> DriftFilter {
        Self::with_covariance(
            initial_estimate,
            process_noise,
            measurement_noise,
            DEFAULT_ERROR_COVARIANCE,
        )
    }

    pub fn with_covariance(
        initial_estimate: f64,
        process_noise: f64,
        measurement_noise: f64,
        error_covariance: f64,
    ) -> DriftFilter {
        DriftFilter {
            estimate: initial_estimate,
            error_covariance: error_covariance.max(0.0),
            process_noise: process_noise.max(0.0),
            measurement_noise: measurement_noise.max(0.0),
        }
    }

    /// Folds one measurement into the estimate and returns the new estimate.
    ///
    /// With a positive measurement noise the gain stays strictly below one,
    /// so the estimate moves toward `measurement` without passing it.
    pub fn update(&mut self, measurement: f64) -> f64 {
        let predicted = self.error_covariance + self.process_noise;
        let denominator = predicted + self.measurement_noise;
        let gain = if denominator > 0.0 {
            predicted / denominator
        } else {
            // Both covariance and noise are zero: nothing to weigh, trust the measurement.
            1.0
        };
        self.estimate += gain * (measurement - self.estimate);
        self.error_covariance = (1.0 - gain) * predicted;
        self.estimate
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }
}
