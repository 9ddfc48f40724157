//! Render jobs
//!
//! A render job is the local process that draws the panel image. It writes
//! PNG bytes to stdout and log lines to stderr, and reports how complete the
//! image is through its exit code.
//!
//! Each job is started as the leader of a new process group and both output
//! streams are drained by their own reader thread, so a chatty log cannot
//! stall image output or the other way around. `RenderJob::wait` enforces a
//! hard deadline and tears down the whole group when it passes.

pub mod process;

use crossbeam::channel;
use nix::unistd::Pid;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Partial render: some panels failed but an image was produced.
pub const ERROR_CODE_MINOR: i32 = 220;
/// Total render failure: the image is an error card.
pub const ERROR_CODE_MAJOR: i32 = 222;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to start renderer {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("failed waiting for renderer: {0}")]
    Wait(#[source] io::Error),

    #[error("image creation process timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("failed reading renderer {stream}: {source}")]
    Output {
        stream: &'static str,
        source: io::Error,
    },
}

/// How to invoke the renderer for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCommand {
    /// Program followed by its fixed leading arguments.
    pub argv: Vec<String>,
    pub config_file: PathBuf,
    pub small_mode: bool,
    pub test_mode: bool,
}

impl RenderCommand {
    pub fn new(argv: Vec<String>, config_file: impl Into<PathBuf>) -> RenderCommand {
        RenderCommand {
            argv,
            config_file: config_file.into(),
            small_mode: false,
            test_mode: false,
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// Full argument list after the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.argv.iter().skip(1).cloned().collect();
        args.push("-c".to_string());
        args.push(self.config_file.display().to_string());
        if self.small_mode {
            args.push("-S".to_string());
        }
        if self.test_mode {
            args.push("-t".to_string());
        }
        args
    }
}

/// What a finished render job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub exit_code: i32,
    pub image: Vec<u8>,
    pub log: String,
}

enum Stream {
    Stdout,
    Stderr,
}

type StreamResult = (Stream, io::Result<Vec<u8>>);

fn spawn_reader<R: Read + Send + 'static>(
    name: &str,
    mut source: R,
    which: Stream,
    tx: channel::Sender<StreamResult>,
) -> io::Result<()> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut buf = Vec::new();
        let res = source.read_to_end(&mut buf).map(|_| buf);
        let _ = tx.send((which, res));
    })?;
    Ok(())
}

pub struct RenderJob {
    child: Child,
    pgid: Pid,
    streams: channel::Receiver<StreamResult>,
    finished: bool,
}

impl RenderJob {
    pub fn spawn(cmd: &RenderCommand) -> Result<RenderJob, RenderError> {
        let spawn_err = |source| RenderError::Spawn {
            program: cmd.program().to_string(),
            source,
        };
        if cmd.argv.is_empty() {
            return Err(spawn_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty renderer command",
            )));
        }

        let mut child = Command::new(cmd.program())
            .args(cmd.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(spawn_err)?;
        let pgid = Pid::from_raw(child.id() as i32);
        info!(pid = child.id(), program = cmd.program(), "start drawing");

        let (tx, rx) = channel::bounded(2);
        let readers = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => spawn_reader("render-stdout", out, Stream::Stdout, tx.clone())
                .and_then(|_| spawn_reader("render-stderr", err, Stream::Stderr, tx)),
            _ => Err(io::Error::new(io::ErrorKind::BrokenPipe, "renderer pipes missing")),
        };
        let job = RenderJob {
            child,
            pgid,
            streams: rx,
            finished: false,
        };
        if let Err(e) = readers {
            job.abort(Duration::ZERO);
            return Err(spawn_err(e));
        }
        Ok(job)
    }

    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    /// Terminates the job's process group and reaps the leader.
    pub fn abort(mut self, grace: Duration) -> process::Termination {
        self.finished = true;
        process::terminate_group(&mut self.child, self.pgid, grace)
    }

    /// Waits for the job to exit and collects its output.
    ///
    /// When `timeout` passes first, the process group gets SIGTERM, then
    /// SIGKILL after `grace`, and `RenderError::Timeout` is returned.
    pub fn wait(mut self, timeout: Duration, grace: Duration) -> Result<RenderOutput, RenderError> {
        let timeout = timeout.min(process::MAX_WAIT);
        let grace = grace.min(process::MAX_WAIT);
        let deadline = Instant::now() + timeout;
        let status = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.finished = true;
                    break status;
                }
                Ok(None) if Instant::now() >= deadline => {
                    warn!(
                        pgid = self.pgid.as_raw(),
                        "render process timed out, terminating process group"
                    );
                    let termination = self.abort(grace);
                    debug!(?termination, "render process group terminated");
                    return Err(RenderError::Timeout(timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    self.abort(grace);
                    return Err(RenderError::Wait(e));
                }
            }
        };
        let exit_code = process::exit_code(&status);

        // Both pipes close once the group exits; anything still holding
        // them past the deadline is treated like a hung job.
        let mut image = None;
        let mut log = None;
        while image.is_none() || log.is_none() {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(grace);
            match self.streams.recv_timeout(remaining) {
                Ok((Stream::Stdout, res)) => {
                    image = Some(res.map_err(|source| RenderError::Output {
                        stream: "stdout",
                        source,
                    })?)
                }
                Ok((Stream::Stderr, res)) => {
                    log = Some(res.map_err(|source| RenderError::Output {
                        stream: "stderr",
                        source,
                    })?)
                }
                Err(_) => {
                    warn!("render output still open after exit, terminating process group");
                    process::terminate_group(&mut self.child, self.pgid, grace);
                    return Err(RenderError::Timeout(timeout));
                }
            }
        }

        Ok(RenderOutput {
            exit_code,
            image: image.unwrap_or_default(),
            log: String::from_utf8_lossy(&log.unwrap_or_default()).into_owned(),
        })
    }
}

impl Drop for RenderJob {
    fn drop(&mut self) {
        if !self.finished {
            warn!(pgid = self.pgid.as_raw(), "render job dropped while running");
            process::terminate_group(&mut self.child, self.pgid, Duration::ZERO);
        }
    }
}
