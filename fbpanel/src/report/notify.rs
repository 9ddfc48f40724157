//! Failure notification
//!
//! Sent once when the supervisor gives up. Delivery goes through an
//! external hook command so any chat/mail integration can be plugged in
//! without this crate knowing about it.

use std::io::{self, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, warn};

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub trait Notifier {
    fn notify(&self, message: &str);
}

/// Runs a hook command with the message on stdin. Without a command the
/// message only goes to the log.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    argv: Option<Vec<String>>,
    timeout: Duration,
}

impl Default for CommandNotifier {
    fn default() -> Self {
        CommandNotifier::new(None)
    }
}

/// Waits for `child` up to `timeout`, killing it once the time is up. The
/// child is always reaped.
fn wait_bounded(child: &mut Child, timeout: Duration) -> io::Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                warn!(error = %e, "failed to kill notification hook");
            }
            child.wait()?;
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("hook still running after {}s", timeout.as_secs_f64()),
            ));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

impl CommandNotifier {
    pub fn new(argv: Option<Vec<String>>) -> CommandNotifier {
        CommandNotifier {
            argv: argv.filter(|a| !a.is_empty()),
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    fn run_hook(&self, argv: &[String], message: &str) -> io::Result<()> {
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        // The writer drops stdin when done so the hook sees end of input.
        // A killed hook breaks the pipe, which unblocks the writer.
        let writer = child.stdin.take().map(|mut stdin| {
            let message = message.to_string();
            thread::spawn(move || stdin.write_all(message.as_bytes()))
        });
        let status = wait_bounded(&mut child, self.timeout)?;
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "hook writer panicked"))??;
        }
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("hook exited with {}", status),
            ));
        }
        Ok(())
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, message: &str) {
        error!("{}", message);
        if let Some(argv) = &self.argv {
            if let Err(e) = self.run_hook(argv, message) {
                warn!(hook = %argv[0], error = %e, "failed to send failure notification");
            }
        }
    }
}
