use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::time::{TimeContext, TimeSignature};

/// Tunables of the orchestration core. Every field has a default, so a config
/// file only needs to list what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lookahead window W in frames. Smaller values lower the latency of
    /// mute/gain changes, larger values absorb more timing jitter.
    pub window_frames: u32,
    /// Rate used for offline rendering and as the decode target when no
    /// device is involved.
    pub sample_rate: u32,
    pub channels: u16,
    pub max_tracks: usize,
    pub command_capacity: usize,
    pub command_timeout_ms: u64,
    /// Events buffered per subscriber before further events are dropped
    /// for that subscriber.
    pub event_capacity: usize,
    /// How long the timing loop sleeps when nothing is due.
    pub idle_poll_ms: u64,
    pub tempo: f64,
    pub time_signature: (u32, u32),
    pub realtime_priority: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            window_frames: 1024,
            sample_rate: 48_000,
            channels: 2,
            max_tracks: 64,
            command_capacity: 256,
            command_timeout_ms: 2_000,
            event_capacity: 1_024,
            idle_poll_ms: 10,
            tempo: 120.0,
            time_signature: (4, 4),
            realtime_priority: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("aixel").join("config.toml"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load from the user config directory, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        match Self::from_file(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!(path = %path.display(), %err, "ignoring unreadable config");
                Self::default()
            }
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    /// Musical time for a stream running at `sample_rate`.
    pub fn time_context(&self, sample_rate: u32) -> TimeContext {
        TimeContext::new(self.tempo, TimeSignature::from(self.time_signature), sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            window_frames = 512
            tempo = 90.0
            "#,
        )
        .unwrap();

        assert_eq!(config.window_frames, 512);
        assert_eq!(config.tempo, 90.0);
        assert_eq!(config.max_tracks, 64);
        assert_eq!(config.time_signature, (4, 4));
        assert_eq!(config.event_capacity, 1_024);
    }

    #[test]
    fn test_time_context_uses_the_given_rate() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.time_context(44_100).sample_rate, 44_100);
        assert_eq!(config.time_context(44_100).bars_to_frames(1.0), 88_200);
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let result = OrchestratorConfig::from_toml_str("window_frames = \"lots\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_tracks = 8\ntime_signature = [3, 4]\n").unwrap();

        let config = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(config.max_tracks, 8);
        assert_eq!(config.time_signature, (3, 4));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = OrchestratorConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
