mod dispatch;
pub mod shutdown;
mod supervisor;

pub use dispatch::{Delivery, Dispatcher};
pub use shutdown::{install_signal_handlers, ShutdownToken, SupervisorState};
pub use supervisor::{Supervisor, SupervisorOptions, FAILURE_BACKOFF, NOTIFY_THRESHOLD};

/// Summary of one refresh cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    /// Image reached the display, possibly from a partial render.
    pub success: bool,
    pub sleep_seconds: f64,
    pub drift_seconds: i32,
    pub error_message: Option<String>,
    pub delivery: Option<Delivery>,
}
