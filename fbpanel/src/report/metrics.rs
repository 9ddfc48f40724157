//! Cycle metrics
//!
//! One record per refresh cycle, handed off to a writer thread so the cycle
//! never waits on disk. The writer appends JSON lines to the configured
//! file. Emission is best effort: a full queue or a dead writer is reported
//! to the caller, who logs it and moves on.

use chrono::{DateTime, Local};
use crossbeam::channel;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use thiserror::Error;
use tracing::{debug, warn};

const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub timestamp: DateTime<Local>,
    pub elapsed_seconds: f64,
    pub small_mode: bool,
    pub test_mode: bool,
    pub one_shot: bool,
    pub host: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub sleep_seconds: f64,
    pub drift_seconds: i32,
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics queue is full")]
    QueueFull,
    #[error("metrics writer has stopped")]
    WriterStopped,
    #[error("cannot open metrics file {path}: {source}")]
    Open { path: String, source: io::Error },
}

pub trait MetricsSink {
    /// Queues `record`. Must not block on I/O.
    fn record(&mut self, record: &CycleMetrics) -> Result<(), MetricsError>;

    /// Flushes pending records and stops any background worker.
    fn shutdown(&mut self) {}
}

/// Sink used when metrics are disabled.
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record(&mut self, _record: &CycleMetrics) -> Result<(), MetricsError> {
        Ok(())
    }
}

pub struct JsonLinesMetrics {
    tx: Option<channel::Sender<CycleMetrics>>,
    worker: Option<thread::JoinHandle<()>>,
    path: PathBuf,
}

impl JsonLinesMetrics {
    /// Opens (creating if needed) `path` for appending and starts the
    /// writer thread.
    pub fn open(path: impl AsRef<Path>) -> Result<JsonLinesMetrics, MetricsError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| MetricsError::Open {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(open_err)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        let (tx, rx) = channel::bounded::<CycleMetrics>(QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("metrics-writer".to_string())
            .spawn(move || {
                for record in rx.iter() {
                    let line = match serde_json::to_string(&record) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "failed to encode metrics record");
                            continue;
                        }
                    };
                    if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                        warn!(error = %e, "failed to write metrics record");
                    }
                }
                debug!("metrics writer exiting");
            })
            .map_err(open_err)?;

        Ok(JsonLinesMetrics {
            tx: Some(tx),
            worker: Some(worker),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonLinesMetrics {
    fn record(&mut self, record: &CycleMetrics) -> Result<(), MetricsError> {
        let tx = self.tx.as_ref().ok_or(MetricsError::WriterStopped)?;
        tx.try_send(record.clone()).map_err(|e| match e {
            channel::TrySendError::Full(_) => MetricsError::QueueFull,
            channel::TrySendError::Disconnected(_) => MetricsError::WriterStopped,
        })
    }

    fn shutdown(&mut self) {
        // Dropping the sender ends the writer loop once the queue drains.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("metrics writer panicked");
            }
        }
    }
}

impl Drop for JsonLinesMetrics {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads back every record in a metrics file.
#[cfg(test)]
fn read_records(path: impl AsRef<Path>) -> io::Result<Vec<CycleMetrics>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)))
        .collect()
}
