//! Liveness heartbeat
//!
//! A file holding the unix time of the last cycle that put a usable image on
//! the display. The health checker compares its age against the refresh
//! interval.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    path: PathBuf,
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Heartbeat {
    pub fn new(path: impl Into<PathBuf>) -> Heartbeat {
        Heartbeat { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records that the pipeline made progress just now.
    pub fn touch(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, format!("{:.3}", unix_now()))
    }

    /// Unix time of the last heartbeat, if one was ever written.
    pub fn last(&self) -> io::Result<f64> {
        let text = fs::read_to_string(&self.path)?;
        text.trim()
            .parse::<f64>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Time since the last heartbeat. Clock steps backward read as zero.
    pub fn age(&self) -> io::Result<Duration> {
        let age = (unix_now() - self.last()?).max(0.0);
        Ok(Duration::from_secs_f64(age))
    }

    /// True when the last heartbeat is no older than `max_age`.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age().map(|age| age <= max_age).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_creates_parent_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let beat = Heartbeat::new(dir.path().join("run/healthz"));
        assert!(beat.last().is_err());
        beat.touch().unwrap();
        assert!(beat.age().unwrap() < Duration::from_secs(5));
        assert!(beat.is_fresh(Duration::from_secs(60)));
    }

    #[test]
    fn stale_or_missing_heartbeat_is_not_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let beat = Heartbeat::new(dir.path().join("healthz"));
        assert!(!beat.is_fresh(Duration::from_secs(60)));

        fs::write(beat.path(), format!("{}", unix_now() - 600.0)).unwrap();
        assert!(!beat.is_fresh(Duration::from_secs(120)));
        assert!(beat.is_fresh(Duration::from_secs(3600)));
    }

    #[test]
    fn garbage_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let beat = Heartbeat::new(dir.path().join("healthz"));
        fs::write(beat.path(), "not a number").unwrap();
        assert_eq!(beat.last().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
