//! Engine configuration

use crate::capture::traits::{Constraints, DeviceKind};
use crate::utils::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the capture engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// How often the recorder emits a chunk
    pub timeslice_ms: u64,

    /// Sampling loop cadence
    pub sample_interval_ms: u64,

    /// Samples kept in the rolling history
    pub history_capacity: usize,

    /// How often progress events are published while recording
    pub progress_interval_ms: u64,

    /// Recording stops on its own after this much recorded time
    pub max_duration_ms: Option<u64>,

    /// A session producing more bytes than this fails
    pub max_bytes: Option<u64>,

    /// How long `stop` waits for the recorder's final flush
    pub flush_timeout_ms: u64,

    /// Encoding to ask the recorder for first
    pub preferred_mime_type: Option<String>,

    /// Encodings to fall back to, in order
    pub fallback_mime_types: Vec<String>,

    pub bits_per_second: Option<u32>,

    /// Stream constraints used by `start`
    pub constraints: Constraints,

    /// Buffered engine events per subscriber
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeslice_ms: 1000,
            sample_interval_ms: 50,
            history_capacity: 100,
            progress_interval_ms: 1000,
            max_duration_ms: None,
            max_bytes: None,
            flush_timeout_ms: 5000,
            preferred_mime_type: None,
            fallback_mime_types: vec![
                "audio/webm;codecs=opus".to_string(),
                "audio/webm".to_string(),
                "audio/ogg".to_string(),
                "audio/mp4".to_string(),
                "video/webm;codecs=vp9".to_string(),
                "video/webm".to_string(),
                "video/mp4".to_string(),
            ],
            bits_per_second: None,
            constraints: Constraints::audio(),
            event_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Defaults for recording a display surface
    pub fn display() -> Self {
        Self {
            constraints: Constraints::display(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeslice_ms == 0 {
            return Err(ConfigError::Invalid("timesliceMs must be positive".into()));
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid("sampleIntervalMs must be positive".into()));
        }
        if self.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid("progressIntervalMs must be positive".into()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("historyCapacity must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("eventCapacity must be positive".into()));
        }
        if self.max_duration_ms == Some(0) {
            return Err(ConfigError::Invalid("maxDurationMs must be positive".into()));
        }
        Ok(())
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration_ms = Some(max.as_millis() as u64);
        self
    }

    pub fn with_max_bytes(mut self, max: u64) -> Self {
        self.max_bytes = Some(max);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.preferred_mime_type = Some(mime_type.into());
        self
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    /// Pick an encoding the adapter supports
    ///
    /// Returns the chosen type and whether it differs from what was asked.
    /// `None` means the adapter supports nothing at all.
    pub fn negotiate_mime_type(&self, kind: DeviceKind, supported: &[String]) -> Option<(String, bool)> {
        let requested = self.preferred_mime_type.as_deref();

        if let Some(requested) = requested {
            if supported.iter().any(|m| m == requested) {
                return Some((requested.to_string(), false));
            }
        }

        let family = match kind {
            DeviceKind::AudioInput => "audio/",
            DeviceKind::DisplaySurface => "video/",
        };

        let chosen = self
            .fallback_mime_types
            .iter()
            .filter(|m| m.starts_with(family))
            .find(|m| supported.iter().any(|s| s == *m))
            .cloned()
            .or_else(|| supported.first().cloned())?;

        Some((chosen, requested.is_some()))
    }
}
