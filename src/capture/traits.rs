//! Capture trait definitions
//!
//! Platform-agnostic capabilities a source adapter provides to the engine:
//! device enumeration, stream acquisition, a recorder primitive and a
//! signal analyser.

use super::acquisition::BindingTable;
use crate::utils::error::PlatformError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Capability kind of a capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Microphone or other audio input
    AudioInput,
    /// Display, window or tab surface
    DisplaySurface,
}

impl DeviceKind {
    /// Label prefix used when the platform withholds a device label
    pub fn fallback_label(&self) -> &'static str {
        match self {
            DeviceKind::AudioInput => "Microphone",
            DeviceKind::DisplaySurface => "Display",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::AudioInput => write!(f, "audioinput"),
            DeviceKind::DisplaySurface => write!(f, "display"),
        }
    }
}

/// A device as reported by the platform, before normalization
///
/// Ids and labels may be empty before permission has been granted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDevice {
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

impl RawDevice {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            is_default: false,
        }
    }
}

/// Information about a capture source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Stable device ID
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Capability kind
    pub kind: DeviceKind,

    /// Whether this is the platform default
    pub is_default: bool,

    /// Whether a session currently holds this device
    pub bound: bool,
}

/// Permission state for a capability kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// Asking will show a prompt
    Prompt,
}

/// What a caller asks of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    pub kind: DeviceKind,

    /// Exact device to bind; `None` picks the default
    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub sample_rate: Option<u32>,

    #[serde(default)]
    pub channel_count: Option<u16>,

    #[serde(default)]
    pub echo_cancellation: bool,

    #[serde(default)]
    pub noise_suppression: bool,

    #[serde(default)]
    pub frame_rate: Option<u32>,

    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,
}

impl Constraints {
    /// Audio input constraints with the platform default device
    pub fn audio() -> Self {
        Self {
            kind: DeviceKind::AudioInput,
            device_id: None,
            sample_rate: None,
            channel_count: None,
            echo_cancellation: true,
            noise_suppression: true,
            frame_rate: None,
            width: None,
            height: None,
        }
    }

    /// Display surface constraints
    pub fn display() -> Self {
        Self {
            kind: DeviceKind::DisplaySurface,
            frame_rate: Some(30),
            echo_cancellation: false,
            noise_suppression: false,
            ..Self::audio()
        }
    }

    /// Same constraints bound to a specific device
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Self::audio()
    }
}

/// Options passed to the recorder primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderOptions {
    pub mime_type: String,

    /// How often the recorder emits a chunk
    pub timeslice_ms: u64,

    #[serde(default)]
    pub bits_per_second: Option<u32>,
}

/// Instantaneous signal data read from a live stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalSnapshot {
    /// Amplitudes in -1.0..=1.0
    pub time_domain: Vec<f32>,

    /// Magnitudes normalized to 0.0..=1.0
    pub frequency: Vec<f32>,
}

/// Events raised by the platform while a source is bound
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    /// The recorder emitted an encoded fragment
    Data(Vec<u8>),
    /// The recorder flushed its last fragment and stopped
    RecorderStopped,
    /// The recorder faulted
    RecorderError(PlatformError),
    /// A track of the bound stream ended (device unplugged, share revoked)
    TrackEnded,
}

/// Where adapters deliver native events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: NativeEvent);
}

/// A live media stream
pub trait MediaStream: Send + Sync {
    fn id(&self) -> &str;

    /// Device the stream was acquired from
    fn device_id(&self) -> &str;

    fn label(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Stop every track. Stopping an already stopped stream does nothing.
    fn stop_tracks(&self);

    fn is_live(&self) -> bool;
}

/// Recorder primitive attached to a stream
pub trait RecorderHandle: Send {
    /// Encoding actually used
    fn mime_type(&self) -> &str;

    fn start(&mut self) -> Result<(), PlatformError>;

    fn pause(&mut self) -> Result<(), PlatformError>;

    fn resume(&mut self) -> Result<(), PlatformError>;

    /// Request the final flush. Remaining data followed by
    /// [`NativeEvent::RecorderStopped`] arrive through the sink.
    fn stop(&mut self) -> Result<(), PlatformError>;
}

/// Reads signal data off a live stream for visualization
pub trait Analyser: Send {
    /// Current snapshot, `None` when nothing is available this tick
    fn snapshot(&mut self) -> Option<SignalSnapshot>;

    fn close(&mut self) -> Result<(), PlatformError>;
}

/// A source adapter (microphone, display, ...)
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &str;

    /// Which of this adapter's devices are held by a session. Every engine
    /// built on the same adapter shares it.
    fn bindings(&self) -> &BindingTable;

    /// List sources of `kind`. An empty list is not an error.
    async fn enumerate(&self, kind: DeviceKind) -> Result<Vec<RawDevice>, PlatformError>;

    /// Query permission without prompting
    async fn permission(&self, kind: DeviceKind) -> PermissionStatus;

    /// Negotiate a live stream, prompting for access if needed
    async fn request_access(
        &self,
        constraints: &Constraints,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn MediaStream>, PlatformError>;

    /// Encodings the recorder primitive can produce for `kind`, best first
    fn supported_mime_types(&self, kind: DeviceKind) -> Vec<String>;

    fn attach_recorder(
        &self,
        stream: Arc<dyn MediaStream>,
        options: &RecorderOptions,
        events: Arc<dyn EventSink>,
    ) -> Result<Box<dyn RecorderHandle>, PlatformError>;

    fn open_analyser(&self, stream: Arc<dyn MediaStream>) -> Result<Box<dyn Analyser>, PlatformError>;
}
