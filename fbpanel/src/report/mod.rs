mod liveness;
pub mod metrics;
mod notify;

pub use liveness::Heartbeat;
pub use metrics::{CycleMetrics, JsonLinesMetrics, MetricsError, MetricsSink, NullMetrics};
pub use notify::{CommandNotifier, Notifier};
