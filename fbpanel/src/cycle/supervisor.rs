//! Cycle supervisor
//!
//! Owns everything that must survive from one refresh cycle to the next:
//! the open session, the refresh scheduler and the failure counter. Each
//! cycle tears down the previous session, reconnects, dispatches, and then
//! either sleeps until the next aligned refresh or backs off after a
//! failure. Repeated failures are escalated through the notifier and end
//! the run.

use super::dispatch::{Delivery, Dispatcher};
use super::shutdown::{SharedSnapshot, ShutdownToken, Snapshot, SupervisorState};
use super::CycleResult;
use crate::remote::{self, Connector};
use crate::render::process;
use crate::report::{CommandNotifier, CycleMetrics, MetricsSink, Notifier, NullMetrics};
use crate::timing::RefreshScheduler;
use crate::util::RetryPolicy;
use crate::Error;
use chrono::Local;
use std::error::Error as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Consecutive failures that end a continuous run.
pub const NOTIFY_THRESHOLD: u32 = 2;
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub host: String,
    pub key_path: PathBuf,
    /// Remote viewer process killed before each reconnect.
    pub viewer: String,
    pub one_shot: bool,
    pub small_mode: bool,
    pub test_mode: bool,
    pub notify_threshold: u32,
    pub failure_backoff: Duration,
    pub retry: RetryPolicy,
}

impl SupervisorOptions {
    pub fn new(host: impl Into<String>, key_path: impl Into<PathBuf>) -> SupervisorOptions {
        SupervisorOptions {
            host: host.into(),
            key_path: key_path.into(),
            viewer: "fbi".to_string(),
            one_shot: false,
            small_mode: false,
            test_mode: false,
            notify_threshold: NOTIFY_THRESHOLD,
            failure_backoff: FAILURE_BACKOFF,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Supervisor<C: Connector> {
    connector: C,
    dispatcher: Dispatcher,
    scheduler: RefreshScheduler,
    options: SupervisorOptions,
    session: Option<C::Session>,
    failures: u32,
    cycles: u64,
    shutdown: ShutdownToken,
    notifier: Box<dyn Notifier>,
    metrics: Box<dyn MetricsSink>,
    snapshot: SharedSnapshot,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        dispatcher: Dispatcher,
        scheduler: RefreshScheduler,
        options: SupervisorOptions,
        shutdown: ShutdownToken,
    ) -> Supervisor<C> {
        Supervisor {
            connector,
            dispatcher,
            scheduler,
            options,
            session: None,
            failures: 0,
            cycles: 0,
            shutdown,
            notifier: Box::new(CommandNotifier::default()),
            metrics: Box::new(NullMetrics),
            snapshot: Arc::new(Mutex::new(Snapshot::default())),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_metrics(mut self, metrics: Box<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Handle on the published state, for the diagnostics signal.
    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn publish(&self, state: SupervisorState, last_result: Option<String>) {
        let mut snap = match self.snapshot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        snap.state = state;
        snap.failures = self.failures;
        snap.cycles = self.cycles;
        if last_result.is_some() {
            snap.last_result = last_result;
        }
    }

    /// Teardown, reconnect and dispatch. A new session is kept even when
    /// the dispatch fails, so the next cycle can tear it down.
    fn refresh(&mut self) -> Result<Delivery, Error> {
        let previous = self.session.take();
        remote::teardown(previous, &self.options.viewer, &self.options.retry)?;

        let session = remote::connect(
            &self.connector,
            &self.options.host,
            &self.options.key_path,
            &self.options.retry,
        )?;
        let session = self.session.insert(session);
        self.dispatcher.run(session)
    }

    /// Whether `err` stops the run instead of backing off.
    fn ends_run(&self, err: &Error) -> bool {
        err.is_fatal()
            || self.options.one_shot
            || self.failures + 1 >= self.options.notify_threshold
    }

    fn emit_metrics(&mut self, record: CycleMetrics) {
        if let Err(e) = self.metrics.record(&record) {
            warn!(error = %e, "failed to log cycle metrics");
        }
    }

    /// Runs one refresh cycle and reports it to the metrics sink.
    pub fn run_cycle(&mut self) -> Result<CycleResult, Error> {
        let started_at = Local::now();
        let start = Instant::now();
        self.cycles += 1;

        let outcome = self.refresh();
        let elapsed = start.elapsed().as_secs_f64();

        let result = match &outcome {
            Ok(delivery) => {
                let (sleep_seconds, drift_seconds) = if self.options.one_shot {
                    (0.0, 0)
                } else {
                    self.scheduler.calculate_sleep_time(elapsed, &Local::now())
                };
                CycleResult {
                    success: delivery.is_success(),
                    sleep_seconds,
                    drift_seconds,
                    error_message: None,
                    delivery: Some(delivery.clone()),
                }
            }
            Err(e) => CycleResult {
                success: false,
                sleep_seconds: if self.ends_run(e) {
                    0.0
                } else {
                    self.options.failure_backoff.as_secs_f64()
                },
                drift_seconds: 0,
                error_message: Some(e.to_string()),
                delivery: None,
            },
        };

        self.emit_metrics(CycleMetrics {
            timestamp: started_at,
            elapsed_seconds: elapsed,
            small_mode: self.options.small_mode,
            test_mode: self.options.test_mode,
            one_shot: self.options.one_shot,
            host: self.options.host.clone(),
            success: result.success,
            error_message: result.error_message.clone(),
            sleep_seconds: result.sleep_seconds,
            drift_seconds: result.drift_seconds,
        });

        outcome.map(|_| result)
    }

    fn escalation_message(&self, err: &Error) -> String {
        let mut message = format!(
            "display on {} failed {} time(s) in a row: {}",
            self.options.host, self.failures, err
        );
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(&format!("\n  caused by: {}", cause));
            source = cause.source();
        }
        message
    }

    /// Runs cycles until shutdown is requested, one-shot mode completes, or
    /// failures escalate. Escalated and fatal errors are returned.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.shutdown.is_requested() {
                break;
            }
            self.publish(SupervisorState::Running, None);

            match self.run_cycle() {
                Ok(result) => {
                    self.failures = 0;
                    self.publish(SupervisorState::Running, Some(format!("{:?}", result.delivery)));
                    if self.options.one_shot {
                        break;
                    }
                    info!("sleep {:.1} sec...", result.sleep_seconds);
                    self.publish(SupervisorState::Sleeping, None);
                    if self.shutdown.sleep(Duration::from_secs_f64(result.sleep_seconds)) {
                        break;
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "renderer failed in an unrecognized way");
                    self.publish(SupervisorState::Terminated, Some(err.to_string()));
                    return Err(err);
                }
                Err(err) => {
                    self.failures += 1;
                    error!(failures = self.failures, error = %err, "failed to display image");
                    self.publish(SupervisorState::Running, Some(err.to_string()));

                    if self.options.one_shot || self.failures >= self.options.notify_threshold {
                        self.publish(SupervisorState::Escalating, None);
                        self.notifier.notify(&self.escalation_message(&err));
                        error!("errors persisted, exiting");
                        self.publish(SupervisorState::Terminated, None);
                        return Err(err);
                    }
                    self.publish(SupervisorState::Sleeping, None);
                    if self.shutdown.sleep(self.options.failure_backoff) {
                        break;
                    }
                }
            }
        }
        self.publish(SupervisorState::Terminated, None);
        Ok(())
    }

    /// Releases what the run left behind: flushes metrics, drops the
    /// session, and kills and reaps any child processes still around.
    pub fn finish(&mut self) {
        self.metrics.shutdown();
        self.session.take();
        let killed = process::kill_children();
        if killed > 0 {
            warn!(killed, "killed leftover child processes");
        }
        process::reap_children();
        info!("shutdown complete");
    }
}
