mod common;

use common::{script_dispatcher, FakeSession};
use fbpanel::cycle::Delivery;
use fbpanel::render::{process, RenderError};
use fbpanel::Error;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Fixture {
        Fixture {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn heartbeat(&self) -> PathBuf {
        self.path("healthz")
    }

    /// Wraps `body` so the renderer records its pid first.
    fn script(&self, body: &str) -> String {
        format!("echo $$ > {}; {}", self.path("pid").display(), body)
    }

    fn renderer_pid(&self) -> Pid {
        let text = fs::read_to_string(self.path("pid")).unwrap();
        Pid::from_raw(text.trim().parse().unwrap())
    }
}

fn assert_cleaned_up(fx: &Fixture, session: &FakeSession) {
    assert_eq!(session.log.lock().unwrap().closes, 1);
    assert!(!process::process_exists(fx.renderer_pid()));
}

#[test]
fn success_displays_and_cleans_up() {
    let fx = Fixture::new();
    let mut session = FakeSession::new(0);
    let dispatcher = script_dispatcher(&fx.script("printf image; echo drawing >&2"), &fx.heartbeat());

    let delivery = dispatcher.run(&mut session).unwrap();

    assert_eq!(delivery, Delivery::Displayed);
    assert_eq!(session.log.lock().unwrap().input, b"image");
    assert!(fx.heartbeat().exists());
    assert_cleaned_up(&fx, &session);
}

#[test]
fn partial_render_still_displays() {
    let fx = Fixture::new();
    let mut session = FakeSession::new(0);
    let dispatcher = script_dispatcher(&fx.script("printf partial; exit 220"), &fx.heartbeat());

    let delivery = dispatcher.run(&mut session).unwrap();

    assert_eq!(delivery, Delivery::PartialRender { code: 220 });
    assert!(delivery.is_success());
    assert_eq!(session.log.lock().unwrap().input, b"partial");
    assert!(fx.heartbeat().exists());
    assert_cleaned_up(&fx, &session);
}

#[test]
fn total_render_failure_skips_heartbeat() {
    let fx = Fixture::new();
    let mut session = FakeSession::new(0);
    let dispatcher = script_dispatcher(&fx.script("printf card; exit 222"), &fx.heartbeat());

    let delivery = dispatcher.run(&mut session).unwrap();

    assert_eq!(delivery, Delivery::RenderFailed { code: 222 });
    assert!(!delivery.is_success());
    assert!(!fx.heartbeat().exists());
    assert_cleaned_up(&fx, &session);
}

#[test]
fn viewer_failure_is_reported_not_raised() {
    let fx = Fixture::new();
    let mut session = FakeSession::new(1);
    let dispatcher = script_dispatcher(&fx.script("printf image"), &fx.heartbeat());

    let delivery = dispatcher.run(&mut session).unwrap();

    assert_eq!(delivery, Delivery::DisplayFailed { status: 1 });
    assert!(!fx.heartbeat().exists());
    assert_cleaned_up(&fx, &session);
}

#[test]
fn broken_channel_raises_after_cleanup() {
    let fx = Fixture::new();
    let mut session = FakeSession::new(-1);
    let dispatcher = script_dispatcher(&fx.script("printf image"), &fx.heartbeat());

    let err = dispatcher.run(&mut session).unwrap_err();

    assert!(matches!(err, Error::Remote(_)));
    assert!(!err.is_fatal());
    assert_cleaned_up(&fx, &session);
}

#[test]
fn unrecognized_exit_is_fatal() {
    let fx = Fixture::new();
    let mut session = FakeSession::new(0);
    let dispatcher = script_dispatcher(&fx.script("exit 3"), &fx.heartbeat());

    let err = dispatcher.run(&mut session).unwrap_err();

    assert!(matches!(err, Error::UnrecognizedExit(3)));
    assert!(err.is_fatal());
    assert_eq!(err.exit_code(), 3);
    assert!(!fx.heartbeat().exists());
    assert_cleaned_up(&fx, &session);
}

fn wait_for_file(path: &Path, limit: Duration) -> String {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Ok(text) = fs::read_to_string(path) {
            if !text.is_empty() {
                return text;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    String::new()
}

#[test]
fn hung_renderer_is_terminated_then_killed() {
    let fx = Fixture::new();
    let mark = fx.path("mark");
    let body = format!(
        "trap 'echo term >> {}' TERM; while :; do sleep 0.1; done",
        mark.display()
    );
    let mut dispatcher = script_dispatcher(&fx.script(&body), &fx.heartbeat());
    dispatcher.render_timeout = Duration::from_millis(500);
    dispatcher.terminate_grace = Duration::from_secs(1);
    let mut session = FakeSession::new(0);

    let start = Instant::now();
    let err = dispatcher.run(&mut session).unwrap_err();

    assert!(matches!(err, Error::Render(RenderError::Timeout(_))));
    assert!(start.elapsed() < Duration::from_secs(10));
    // The trap ignores SIGTERM, so only SIGKILL could have ended it.
    assert!(wait_for_file(&mark, Duration::from_secs(1)).contains("term"));
    assert!(session.log.lock().unwrap().input.is_empty());
    assert!(!fx.heartbeat().exists());
    assert_cleaned_up(&fx, &session);
}

#[test]
fn timeout_reaps_orphaned_render_descendants() {
    process::become_subreaper().unwrap();
    let fx = Fixture::new();
    let grandchild = fx.path("grandchild");
    let body = format!(
        "sleep 30 </dev/null >/dev/null 2>&1 & echo $! > {}; trap '' TERM; while :; do sleep 0.1; done",
        grandchild.display()
    );
    let mut dispatcher = script_dispatcher(&fx.script(&body), &fx.heartbeat());
    dispatcher.render_timeout = Duration::from_millis(500);
    dispatcher.terminate_grace = Duration::from_millis(200);
    let mut session = FakeSession::new(0);

    let err = dispatcher.run(&mut session).unwrap_err();

    assert!(matches!(err, Error::Render(RenderError::Timeout(_))));
    let pid: i32 = wait_for_file(&grandchild, Duration::from_secs(1))
        .trim()
        .parse()
        .unwrap();
    assert!(!process::process_exists(Pid::from_raw(pid)));
    assert_cleaned_up(&fx, &session);
}
