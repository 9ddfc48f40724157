#![allow(dead_code)]

use fbpanel::cycle::Dispatcher;
use fbpanel::remote::{Connector, RemoteCommand, RemoteError, RemoteExit, RemoteSession};
use fbpanel::render::RenderCommand;
use fbpanel::report::{CycleMetrics, Heartbeat, MetricsError, MetricsSink, Notifier};
use fbpanel::util::RetryPolicy;
use fbpanel::ShutdownToken;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything the fake remote side observed.
#[derive(Debug, Default)]
pub struct RemoteLog {
    pub connects: usize,
    pub commands: Vec<String>,
    pub input: Vec<u8>,
    pub closes: usize,
    pub disconnects: usize,
}

pub type SharedLog = Arc<Mutex<RemoteLog>>;

pub struct FakeCommand {
    log: SharedLog,
    status: i32,
}

impl RemoteCommand for FakeCommand {
    fn write_input(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        self.log.lock().unwrap().input.extend_from_slice(data);
        Ok(())
    }

    fn finish_input(&mut self) -> Result<(), RemoteError> {
        Ok(())
    }

    fn wait(&mut self) -> Result<RemoteExit, RemoteError> {
        if self.status < 0 {
            return Err(RemoteError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "channel reset",
            )));
        }
        Ok(RemoteExit {
            status: self.status,
            stdout: String::new(),
            stderr: if self.status == 0 {
                String::new()
            } else {
                "fbi: cannot open framebuffer".to_string()
            },
        })
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        self.log.lock().unwrap().closes += 1;
        Ok(())
    }
}

pub struct FakeSession {
    pub log: SharedLog,
    /// Exit status of every command; negative makes `wait` fail.
    pub status: i32,
}

impl FakeSession {
    pub fn new(status: i32) -> FakeSession {
        FakeSession {
            log: SharedLog::default(),
            status,
        }
    }
}

impl RemoteSession for FakeSession {
    type Command = FakeCommand;

    fn exec(&mut self, command: &str) -> Result<FakeCommand, RemoteError> {
        self.log.lock().unwrap().commands.push(command.to_string());
        Ok(FakeCommand {
            log: self.log.clone(),
            status: self.status,
        })
    }

    fn disconnect(&mut self) -> Result<(), RemoteError> {
        self.log.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

/// Connector whose sessions share one log. `failing` holds one flag per
/// upcoming connect; `true` makes that connect fail. Once `stop_after`
/// connects have happened, shutdown is requested.
pub struct FakeConnector {
    pub log: SharedLog,
    pub failing: Mutex<Vec<bool>>,
    pub stop_after: Option<(usize, ShutdownToken)>,
}

impl FakeConnector {
    pub fn new(failing: Vec<bool>) -> FakeConnector {
        FakeConnector {
            log: SharedLog::default(),
            failing: Mutex::new(failing.into_iter().rev().collect()),
            stop_after: None,
        }
    }

    pub fn stop_after(mut self, connects: usize, token: ShutdownToken) -> FakeConnector {
        self.stop_after = Some((connects, token));
        self
    }
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    fn connect(&self, host: &str, _key_path: &Path) -> Result<FakeSession, RemoteError> {
        let connects = {
            let mut log = self.log.lock().unwrap();
            log.connects += 1;
            log.connects
        };
        if let Some((limit, token)) = &self.stop_after {
            if connects >= *limit {
                token.request();
            }
        }
        if self.failing.lock().unwrap().pop().unwrap_or(false) {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        Ok(FakeSession {
            log: self.log.clone(),
            status: 0,
        })
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub messages: Arc<Mutex<Vec<String>>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

#[derive(Clone, Default)]
pub struct RecordingMetrics {
    pub records: Arc<Mutex<Vec<CycleMetrics>>>,
    /// Fail every record call after storing it.
    pub fail: bool,
}

impl MetricsSink for RecordingMetrics {
    fn record(&mut self, record: &CycleMetrics) -> Result<(), MetricsError> {
        self.records.lock().unwrap().push(record.clone());
        if self.fail {
            return Err(MetricsError::WriterStopped);
        }
        Ok(())
    }
}

/// Dispatcher running `script` through `/bin/sh` as the renderer.
pub fn script_dispatcher(script: &str, heartbeat: &Path) -> Dispatcher {
    Dispatcher {
        render: RenderCommand::new(
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "renderer".to_string(),
            ],
            "config.yaml",
        ),
        display_command: "cat - > /dev/null".to_string(),
        render_timeout: Duration::from_secs(20),
        terminate_grace: Duration::from_millis(300),
        minor_code: 220,
        major_code: 222,
        heartbeat: Heartbeat::new(heartbeat),
        retry: RetryPolicy::immediate(1),
    }
}
