//! Process group control
//!
//! Render jobs run as leaders of their own process group, so the whole tree
//! they spawn can be signalled at once. These helpers wrap the unix calls
//! used to terminate a group and to reap children without blocking.
//!
//! A group's leader is our child, but its own children are not. Once the
//! leader is gone they are reparented, and only come back to us for
//! reaping when this process is a child subreaper (`become_subreaper`).

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long `terminate_group` keeps reaping a killed group.
const DRAIN_LIMIT: Duration = Duration::from_millis(500);

/// Longest wait any helper here accepts.
pub const MAX_WAIT: Duration = Duration::from_secs(86_400);

/// Makes orphaned descendants reparent to this process instead of init, so
/// they can be reaped with their process group.
pub fn become_subreaper() -> nix::Result<()> {
    nix::sys::prctl::set_child_subreaper(true)
}

/// Signals delivered by `terminate_group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub terminated: bool,
    pub killed: bool,
}

fn signal_group(pgid: Pid, signal: Signal) -> bool {
    match killpg(pgid, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid = pgid.as_raw(), ?signal, error = %e, "failed to signal process group");
            false
        }
    }
}

/// Sends SIGTERM to every process in `pgid`, waits up to `grace` for
/// `leader` to exit, then SIGKILLs whatever is left of the group. The
/// leader is reaped before returning.
pub fn terminate_group(leader: &mut Child, pgid: Pid, grace: Duration) -> Termination {
    let terminated = signal_group(pgid, Signal::SIGTERM);

    let deadline = Instant::now() + grace.min(MAX_WAIT);
    while Instant::now() < deadline {
        match leader.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }

    // Survivors may include grandchildren even when the leader is gone.
    let killed = signal_group(pgid, Signal::SIGKILL);
    if let Err(e) = leader.wait() {
        debug!(error = %e, "render job already reaped");
    }
    drain_group(pgid, DRAIN_LIMIT);
    Termination { terminated, killed }
}

/// Reaps members of `pgid` until the group is empty or `limit` passes.
/// Returns the number reaped. Members we cannot reap (reparented to
/// someone else) keep the group alive until the limit.
pub fn drain_group(pgid: Pid, limit: Duration) -> usize {
    let deadline = Instant::now() + limit.min(MAX_WAIT);
    let mut reaped = 0;
    loop {
        reaped += reap_group(pgid);
        if matches!(killpg(pgid, None), Err(Errno::ESRCH)) || Instant::now() >= deadline {
            return reaped;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Reaps exited members of `pgid` that are still our children.
pub fn reap_group(pgid: Pid) -> usize {
    reap(Pid::from_raw(-pgid.as_raw()))
}

/// Reaps any exited child of this process.
pub fn reap_children() -> usize {
    reap(Pid::from_raw(-1))
}

fn reap(target: Pid) -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                debug!(?status, "reaped child");
                reaped += 1;
            }
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    reaped
}

/// Direct children of this process, from procfs. Empty where procfs is
/// unavailable.
pub fn child_pids() -> Vec<Pid> {
    let Ok(tasks) = std::fs::read_dir("/proc/self/task") else {
        return Vec::new();
    };
    let mut pids = Vec::new();
    for task in tasks.flatten() {
        let Ok(children) = std::fs::read_to_string(task.path().join("children")) else {
            continue;
        };
        pids.extend(
            children
                .split_whitespace()
                .filter_map(|p| p.parse::<i32>().ok())
                .map(Pid::from_raw),
        );
    }
    pids
}

/// SIGKILLs every remaining direct child, then reaps. Returns the number of
/// children signalled.
pub fn kill_children() -> usize {
    let children = child_pids();
    for pid in &children {
        if let Err(e) = kill(*pid, Signal::SIGKILL) {
            debug!(pid = pid.as_raw(), error = %e, "child already gone");
        }
    }
    reap_children();
    children.len()
}

/// Exit code as a shell would report it: the code itself, or 128 plus the
/// signal number for a signalled process.
pub fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

/// True while `pid` exists, zombies included.
pub fn process_exists(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}
