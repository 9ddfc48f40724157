//! Configuration
//!
//! YAML file shared with the renderer. Only the keys the orchestrator uses
//! are modelled; unknown keys are ignored so the renderer's own sections can
//! live in the same file. Every section has defaults.

use crate::remote::ssh::{self, SshConnector};
use crate::render::{self, RenderCommand};
use crate::timing::{self, SchedulerConfig};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub panel: PanelConfig,
    pub liveness: LivenessConfig,
    pub metrics: MetricsConfig,
    pub remote: RemoteConfig,
    pub renderer: RendererConfig,
    pub timing: TimingConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Seconds between refreshes.
    pub interval: u32,
    /// Second of the minute refreshes should complete on.
    pub target_second: u32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            interval: 60,
            target_second: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub file: LivenessFileConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LivenessFileConfig {
    pub display: PathBuf,
}

impl Default for LivenessFileConfig {
    fn default() -> Self {
        LivenessFileConfig {
            display: PathBuf::from("/dev/shm/healthz"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Metrics log file. Metrics are off when unset.
    pub data: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub user: String,
    pub port: u16,
    /// Framebuffer viewer binary; also the process killed on teardown.
    pub viewer: String,
    pub image_path: String,
    pub framebuffer: String,
    pub connect_timeout: f64,
    pub command_timeout: f64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            user: ssh::DEFAULT_USER.to_string(),
            port: ssh::DEFAULT_PORT,
            viewer: "fbi".to_string(),
            image_path: "/dev/shm/display.png".to_string(),
            framebuffer: "/dev/fb0".to_string(),
            connect_timeout: ssh::DEFAULT_CONNECT_TIMEOUT.as_secs_f64(),
            command_timeout: ssh::DEFAULT_COMMAND_TIMEOUT.as_secs_f64(),
        }
    }
}

impl RemoteConfig {
    /// Shell pipeline that stores stdin as the image and shows it once. Its
    /// exit status is the viewer's.
    pub fn display_command(&self) -> String {
        format!(
            "cat - > {image} && sudo {viewer} -1 -T 1 -d {fb} --noverbose {image}",
            image = self.image_path,
            viewer = self.viewer,
            fb = self.framebuffer,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Program and leading arguments; mode flags are appended per cycle.
    pub command: Vec<String>,
    pub timeout: f64,
    pub grace: f64,
    pub minor_code: i32,
    pub major_code: i32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            command: vec!["fbpanel-render".to_string()],
            timeout: render::DEFAULT_RENDER_TIMEOUT.as_secs_f64(),
            grace: render::DEFAULT_TERMINATE_GRACE.as_secs_f64(),
            minor_code: render::ERROR_CODE_MINOR,
            major_code: render::ERROR_CODE_MAJOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub process_noise: f64,
    pub measurement_noise: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            process_noise: timing::DEFAULT_PROCESS_NOISE,
            measurement_noise: timing::DEFAULT_MEASUREMENT_NOISE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Hook command receiving the failure message on stdin.
    pub command: Option<Vec<String>>,
}

/// Upper bound for every configured duration.
pub const MAX_DURATION_SECS: f64 = 86_400.0;

fn bounded_secs(key: &'static str, secs: f64, allow_zero: bool) -> Result<Duration, ConfigError> {
    let in_range = if allow_zero { secs >= 0.0 } else { secs > 0.0 };
    if !(in_range && secs <= MAX_DURATION_SECS) {
        return Err(invalid(
            key,
            format!("must be between 0 and {} seconds, got {}", MAX_DURATION_SECS, secs),
        ));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(key, e.to_string()))
}

/// Conversion for accessors on a config that may have skipped `validate`.
fn secs_or(secs: f64, fallback: Duration) -> Duration {
    if secs.is_finite() && secs <= MAX_DURATION_SECS {
        Duration::try_from_secs_f64(secs).unwrap_or(fallback)
    } else {
        fallback
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.panel.update.interval == 0 {
            return Err(invalid("panel.update.interval", "must be positive"));
        }
        if self.panel.update.target_second >= 60 {
            return Err(invalid("panel.update.target_second", "must be 0-59"));
        }
        if self.renderer.command.is_empty() {
            return Err(invalid("renderer.command", "must not be empty"));
        }
        if self.renderer.minor_code == self.renderer.major_code {
            return Err(invalid("renderer.minor_code", "must differ from renderer.major_code"));
        }
        if self.renderer.minor_code == 0 || self.renderer.major_code == 0 {
            return Err(invalid("renderer.major_code", "exit code 0 is reserved for success"));
        }
        if self.remote.viewer.trim().is_empty() {
            return Err(invalid("remote.viewer", "must not be empty"));
        }
        bounded_secs("renderer.timeout", self.renderer.timeout, false)?;
        bounded_secs("renderer.grace", self.renderer.grace, true)?;
        bounded_secs("remote.connect_timeout", self.remote.connect_timeout, false)?;
        bounded_secs("remote.command_timeout", self.remote.command_timeout, false)?;
        if !(self.timing.process_noise >= 0.0 && self.timing.measurement_noise > 0.0) {
            return Err(invalid(
                "timing.measurement_noise",
                "noise must be non-negative and measurement noise positive",
            ));
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.panel.update.interval as u64)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            update_interval_secs: self.panel.update.interval,
            target_second: self.panel.update.target_second,
            process_noise: self.timing.process_noise,
            measurement_noise: self.timing.measurement_noise,
        }
    }

    pub fn ssh_connector(&self) -> SshConnector {
        SshConnector {
            user: self.remote.user.clone(),
            port: self.remote.port,
            connect_timeout: secs_or(self.remote.connect_timeout, ssh::DEFAULT_CONNECT_TIMEOUT),
            command_timeout: secs_or(self.remote.command_timeout, ssh::DEFAULT_COMMAND_TIMEOUT),
        }
    }

    pub fn render_command(&self, config_file: impl Into<PathBuf>) -> RenderCommand {
        RenderCommand::new(self.renderer.command.clone(), config_file)
    }

    pub fn render_timeout(&self) -> Duration {
        secs_or(self.renderer.timeout, render::DEFAULT_RENDER_TIMEOUT)
    }

    pub fn render_grace(&self) -> Duration {
        secs_or(self.renderer.grace, render::DEFAULT_TERMINATE_GRACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.panel.update.interval, 60);
        assert_eq!(config.remote.user, "ubuntu");
        assert_eq!(config.renderer.minor_code, 220);
        assert_eq!(config.renderer.major_code, 222);
        assert_eq!(config.render_timeout(), Duration::from_secs(300));
        assert!(config.metrics.data.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let text = r#"
panel:
  update:
    interval: 120
    target_second: 30
  device:
    width: 800
liveness:
  file:
    display: /tmp/healthz
metrics:
  data: data/metrics.jsonl
renderer:
  command: [python3, create_image.py]
notify:
  command: [notify-hook, --channel, panel]
"#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.update_interval(), Duration::from_secs(120));
        assert_eq!(config.scheduler().target_second, 30);
        assert_eq!(config.liveness.file.display, PathBuf::from("/tmp/healthz"));
        assert_eq!(config.metrics.data, Some(PathBuf::from("data/metrics.jsonl")));
        assert_eq!(config.renderer.command, vec!["python3", "create_image.py"]);
        assert_eq!(config.renderer.timeout, 300.0);
        assert_eq!(config.notify.command.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn display_command_pipes_into_viewer() {
        let config = Config::default();
        assert_eq!(
            config.remote.display_command(),
            "cat - > /dev/shm/display.png && sudo fbi -1 -T 1 -d /dev/fb0 --noverbose /dev/shm/display.png"
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            Config::parse("panel: {update: {interval: 0}}"),
            Err(ConfigError::Invalid { key: "panel.update.interval", .. })
        ));
        assert!(matches!(
            Config::parse("panel: {update: {target_second: 60}}"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            Config::parse("renderer: {minor_code: 5, major_code: 5}"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            Config::parse("renderer: {timeout: -1}"),
            Err(ConfigError::Invalid { key: "renderer.timeout", .. })
        ));
        assert!(matches!(
            Config::parse("renderer: {timeout: 1.0e30}"),
            Err(ConfigError::Invalid { key: "renderer.timeout", .. })
        ));
        assert!(matches!(
            Config::parse("renderer: {timeout: .nan}"),
            Err(ConfigError::Invalid { key: "renderer.timeout", .. })
        ));
        assert!(matches!(
            Config::parse("remote: {command_timeout: .inf}"),
            Err(ConfigError::Invalid { key: "remote.command_timeout", .. })
        ));
        assert!(matches!(
            Config::parse("renderer: {grace: -1}"),
            Err(ConfigError::Invalid { key: "renderer.grace", .. })
        ));
        assert!(matches!(
            Config::parse("renderer: {command: []}"),
            Err(ConfigError::Invalid { key: "renderer.command", .. })
        ));
    }

    #[test]
    fn accessors_fall_back_on_unvalidated_durations() {
        let mut config = Config::default();
        config.renderer.timeout = 1.0e30;
        config.renderer.grace = f64::NAN;
        config.remote.connect_timeout = -3.0;
        assert_eq!(config.render_timeout(), render::DEFAULT_RENDER_TIMEOUT);
        assert_eq!(config.render_grace(), render::DEFAULT_TERMINATE_GRACE);
        assert_eq!(config.ssh_connector().connect_timeout, ssh::DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn largest_allowed_timeout_is_accepted() {
        let config = Config::parse("renderer: {timeout: 86400}").unwrap();
        assert_eq!(config.render_timeout(), Duration::from_secs(86_400));
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        assert!(matches!(Config::parse("panel: [unclosed"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("/nonexistent/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
