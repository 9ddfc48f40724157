//! Remote session
//!
//! The display host is driven through a `RemoteSession`: a live connection
//! able to start commands whose input stays open until the caller has data
//! for it. `ssh` provides the production implementation; everything else in
//! the crate only sees these traits, so the cycle logic can be exercised
//! against in-memory sessions.
//!
//! Session lifecycle per refresh cycle:
//! - `teardown()` the session from the previous cycle, killing any viewer
//!   process it left behind.
//! - `connect()` a fresh session.
//!
//! Both are retried with the crate's fixed `RetryPolicy`.

pub mod ssh;

use crate::util::{run_with_retry, RetryPolicy};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use ssh::{SshCommand, SshConnector, SshSession};

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("failed to reach {host}: {source}")]
    Connect { host: String, source: io::Error },

    #[error("cannot read key file {path}: {source}")]
    KeyFile { path: String, source: io::Error },

    #[error("ssh error: {0}")]
    Ssh(ssh2::Error),

    #[error("remote I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("remote session is no longer valid")]
    SessionInvalid,

    #[error("remote command failed: {0}")]
    Command(String),
}

impl RemoteError {
    /// The session was already closed or its transport is gone. Teardown
    /// treats this as nothing left to clean up.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, RemoteError::SessionInvalid)
    }
}

/// Exit report of a finished remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteExit {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A command running on the remote host with its input still open.
pub trait RemoteCommand {
    /// Sends bytes to the command's standard input.
    fn write_input(&mut self, data: &[u8]) -> Result<(), RemoteError>;

    /// Signals end of input.
    fn finish_input(&mut self) -> Result<(), RemoteError>;

    /// Blocks until the command exits, collecting its output streams.
    fn wait(&mut self) -> Result<RemoteExit, RemoteError>;

    /// Releases the command's channel. Must be safe to call at any point,
    /// including before `wait()` and more than once.
    fn close(&mut self) -> Result<(), RemoteError>;
}

pub trait RemoteSession {
    type Command: RemoteCommand;

    /// Starts `command` without waiting for it to finish.
    fn exec(&mut self, command: &str) -> Result<Self::Command, RemoteError>;

    fn disconnect(&mut self) -> Result<(), RemoteError>;
}

/// Opens sessions to a display host.
pub trait Connector {
    type Session: RemoteSession;

    /// Single connection attempt. Implementations must release anything
    /// they opened before returning an error.
    fn connect(&self, host: &str, key_path: &Path) -> Result<Self::Session, RemoteError>;
}

/// Command used to kill a stale viewer left running by a previous cycle.
pub fn kill_command(process_name: &str) -> String {
    format!("sudo killall -9 {}", process_name)
}

fn kill_and_disconnect<S: RemoteSession>(session: &mut S, process_name: &str) -> Result<(), RemoteError> {
    let mut command = session.exec(&kill_command(process_name))?;
    // killall exits nonzero when nothing matched, which is the common case.
    let waited = command.wait();
    if let Err(e) = command.close() {
        warn!(error = %e, "error closing kill command channel");
    }
    let exit = waited?;
    debug!(status = exit.status, process = process_name, "stale viewer kill finished");
    session.disconnect()
}

/// Kills `process_name` over `session` and closes it.
///
/// `None` is a no-op, as is a session that is already invalid. Other errors
/// are retried per `policy`; the session is dropped either way.
pub fn teardown<S: RemoteSession>(
    session: Option<S>,
    process_name: &str,
    policy: &RetryPolicy,
) -> Result<(), RemoteError> {
    let Some(mut session) = session else {
        return Ok(());
    };
    run_with_retry(policy, "teardown", || {
        match kill_and_disconnect(&mut session, process_name) {
            Err(e) if e.is_session_invalid() => {
                debug!("previous session already closed");
                Ok(())
            }
            other => other,
        }
    })
}

/// Opens a session to `host`, retrying per `policy`.
pub fn connect<C: Connector>(
    connector: &C,
    host: &str,
    key_path: &Path,
    policy: &RetryPolicy,
) -> Result<C::Session, RemoteError> {
    run_with_retry(policy, "connect", || {
        info!(host, "connecting");
        connector.connect(host, key_path)
    })
}
