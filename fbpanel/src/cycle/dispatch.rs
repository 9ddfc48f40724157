//! Render dispatch and delivery
//!
//! One refresh cycle over an open session:
//! 1. start the remote display command, leaving its input open;
//! 2. run the render job locally under a hard deadline;
//! 3. stream the finished image into the remote command and close its input;
//! 4. classify the renderer's and the viewer's exit codes.
//!
//! Channel close and child reaping run from a drop guard, so they happen
//! exactly once on every path out of `Dispatcher::run`, errors included.
//! Reaping is scoped to the render job's process group: the leader is
//! harvested by the job itself, and descendants orphaned by it come back
//! to this process for reaping once it is a child subreaper
//! (`render::process::become_subreaper`). Unrelated children of the
//! process are left alone.

use crate::config::Config;
use crate::remote::{RemoteCommand, RemoteExit, RemoteSession};
use crate::render::{process, RenderCommand, RenderJob};
use crate::report::Heartbeat;
use crate::util::{run_with_retry, RetryPolicy};
use crate::Error;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a cycle that ran to the end without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Image rendered and shown.
    Displayed,
    /// Some panels failed; the image was still shown.
    PartialRender { code: i32 },
    /// Nothing usable was rendered.
    RenderFailed { code: i32 },
    /// Rendering worked but the viewer failed.
    DisplayFailed { status: i32 },
}

impl Delivery {
    /// Whether the cycle counts as a success for liveness purposes.
    pub fn is_success(&self) -> bool {
        matches!(self, Delivery::Displayed | Delivery::PartialRender { .. })
    }
}

struct CycleCleanup<C: RemoteCommand> {
    command: C,
    render_group: Option<Pid>,
}

impl<C: RemoteCommand> Drop for CycleCleanup<C> {
    fn drop(&mut self) {
        if let Err(e) = self.command.close() {
            warn!(error = %e, "error closing display command channel");
        }
        if let Some(pgid) = self.render_group {
            let reaped = process::reap_group(pgid);
            debug!(pgid = pgid.as_raw(), reaped, "render group reaped");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    pub render: RenderCommand,
    pub display_command: String,
    pub render_timeout: Duration,
    pub terminate_grace: Duration,
    pub minor_code: i32,
    pub major_code: i32,
    pub heartbeat: Heartbeat,
    pub retry: RetryPolicy,
}

impl Dispatcher {
    pub fn from_config(
        config: &Config,
        config_file: impl Into<PathBuf>,
        small_mode: bool,
        test_mode: bool,
    ) -> Dispatcher {
        let mut render = config.render_command(config_file);
        render.small_mode = small_mode;
        render.test_mode = test_mode;
        Dispatcher {
            render,
            display_command: config.remote.display_command(),
            render_timeout: config.render_timeout(),
            terminate_grace: config.render_grace(),
            minor_code: config.renderer.minor_code,
            major_code: config.renderer.major_code,
            heartbeat: Heartbeat::new(&config.liveness.file.display),
            retry: RetryPolicy::default(),
        }
    }

    /// Runs one refresh over `session`.
    ///
    /// Render and display failures with known exit codes come back as a
    /// `Delivery`. Timeouts, transport errors and unrecognized renderer exit
    /// codes are errors.
    pub fn run<S: RemoteSession>(&self, session: &mut S) -> Result<Delivery, Error> {
        let command = run_with_retry(&self.retry, "display command", || {
            session.exec(&self.display_command)
        })?;
        let mut cleanup = CycleCleanup {
            command,
            render_group: None,
        };

        let job = RenderJob::spawn(&self.render)?;
        cleanup.render_group = Some(job.pgid());
        let output = job.wait(self.render_timeout, self.terminate_grace)?;

        cleanup.command.write_input(&output.image)?;
        cleanup.command.finish_input()?;
        for line in output.log.lines() {
            info!(target: "renderer", "{}", line);
        }

        let remote = cleanup.command.wait()?;
        self.classify(output.exit_code, &remote)
    }

    fn touch_heartbeat(&self) {
        if let Err(e) = self.heartbeat.touch() {
            warn!(path = %self.heartbeat.path().display(), error = %e, "failed to update liveness");
        }
    }

    fn classify(&self, code: i32, remote: &RemoteExit) -> Result<Delivery, Error> {
        if code == 0 && remote.status == 0 {
            info!("succeeded");
            self.touch_heartbeat();
            Ok(Delivery::Displayed)
        } else if code == self.major_code {
            warn!(code, "failed to create image at all");
            Ok(Delivery::RenderFailed { code })
        } else if code == self.minor_code {
            warn!(code, "failed to create image partially");
            self.touch_heartbeat();
            Ok(Delivery::PartialRender { code })
        } else if code == 0 {
            warn!(code = remote.status, "failed to display image");
            warn!("[stdout] {}", remote.stdout.trim_end());
            warn!("[stderr] {}", remote.stderr.trim_end());
            Ok(Delivery::DisplayFailed {
                status: remote.status,
            })
        } else {
            Err(Error::UnrecognizedExit(code))
        }
    }
}
