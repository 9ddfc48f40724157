//! Shutdown and diagnostics signals
//!
//! Termination requests are only observed between cycles: the supervisor
//! sleeps on a `ShutdownToken`, which wakes early once shutdown has been
//! requested. A cycle already in flight always runs to completion.
//!
//! `install_signal_handlers` bridges unix signals onto the token from a
//! dedicated thread:
//! - SIGTERM and SIGINT request shutdown.
//! - SIGUSR1 logs a diagnostics snapshot and changes nothing.

use crossbeam::channel;
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
    wake_tx: channel::Sender<()>,
    wake_rx: channel::Receiver<()>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("requested", &self.is_requested())
            .finish()
    }
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        let (wake_tx, wake_rx) = channel::bounded(1);
        ShutdownToken {
            requested: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless shutdown is requested first. Returns
    /// true when shutdown was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        match self.wake_rx.recv_timeout(duration) {
            Ok(()) => true,
            Err(_) => self.is_requested(),
        }
    }
}

/// Where the supervisor is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Sleeping,
    Escalating,
    Terminated,
}

/// State published by the supervisor for the diagnostics signal.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: SupervisorState,
    pub failures: u32,
    pub cycles: u64,
    pub last_result: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            state: SupervisorState::Idle,
            failures: 0,
            cycles: 0,
            last_result: None,
        }
    }
}

pub type SharedSnapshot = Arc<Mutex<Snapshot>>;

/// Names of this process's threads, from procfs.
fn thread_names() -> Vec<String> {
    let Ok(tasks) = std::fs::read_dir("/proc/self/task") else {
        return Vec::new();
    };
    let mut names: Vec<String> = tasks
        .flatten()
        .map(|task| {
            let tid = task.file_name().to_string_lossy().into_owned();
            let comm = std::fs::read_to_string(task.path().join("comm")).unwrap_or_default();
            format!("{}:{}", tid, comm.trim())
        })
        .collect();
    names.sort();
    names
}

pub fn log_diagnostics(snapshot: &SharedSnapshot) {
    let snap = match snapshot.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    info!(
        state = ?snap.state,
        failures = snap.failures,
        cycles = snap.cycles,
        last = snap.last_result.as_deref().unwrap_or("-"),
        "diagnostics snapshot"
    );
    for name in thread_names() {
        info!(thread = %name, "diagnostics thread");
    }
}

/// Starts the signal bridging thread.
pub fn install_signal_handlers(token: ShutdownToken, snapshot: SharedSnapshot) -> io::Result<()> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGUSR1])?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGTERM | SIGINT => {
                        warn!(signal, "received termination signal");
                        token.request();
                    }
                    SIGUSR1 => log_diagnostics(&snapshot),
                    _ => {}
                }
            }
        })?;
    Ok(())
}
