pub mod config;
pub mod cycle;
pub mod remote;
pub mod render;
pub mod report;
pub mod timing;
pub mod util;

mod error;

pub use config::Config;
pub use cycle::{CycleResult, Dispatcher, ShutdownToken, Supervisor};
pub use error::Error;
pub use timing::{DriftFilter, RefreshScheduler};
