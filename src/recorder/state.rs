//! Recording state management
//!
//! Defines the capture session state machine and segment tracking.

use crate::capture::traits::DeviceDescriptor;
use crate::recorder::reporter::ReportedError;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// No session in progress
    #[default]
    Idle,
    /// Waiting on the platform/user for a stream
    AcquiringPermission,
    /// Stream bound and sampled, not recording
    Capturing,
    /// Recorder running, duration advancing
    Recording,
    /// Recorder paused, stream still live
    Paused,
    /// Waiting for the recorder's final flush
    Stopping,
    /// Artifact produced
    Stopped,
    /// Discarded by the caller
    Cancelled,
    /// Ended by a classified error
    Failed,
}

impl SessionState {
    /// `Stopped`, `Cancelled` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Stopped | SessionState::Cancelled | SessionState::Failed
        )
    }

    /// A stream is bound to the session in this state
    pub fn holds_stream(&self) -> bool {
        matches!(
            self,
            SessionState::Capturing
                | SessionState::Recording
                | SessionState::Paused
                | SessionState::Stopping
        )
    }

    /// Chunks from the recorder may be appended in this state
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, SessionState::Recording | SessionState::Stopping)
    }

    /// A new session may be started from this state
    pub fn can_start(&self) -> bool {
        *self == SessionState::Idle || self.is_terminal()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringPermission => "acquiring-permission",
            SessionState::Capturing => "capturing",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Caller commands validated against the state table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    Start,
    BeginRecording,
    Pause,
    Resume,
    Stop,
    Cancel,
    SwitchDevice,
    Clear,
    Download,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Start => "start",
            Command::BeginRecording => "begin recording",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
            Command::Cancel => "cancel",
            Command::SwitchDevice => "switch device",
            Command::Clear => "clear",
            Command::Download => "download",
        };
        write!(f, "{}", name)
    }
}

/// State a command leads to from `state`, or `None` if it is illegal there.
///
/// Device switching is not listed; its legality depends on more than the
/// state and is decided by the controller.
pub fn transition(state: SessionState, command: Command) -> Option<SessionState> {
    use SessionState::*;

    match (state, command) {
        (s, Command::Start) if s.can_start() => Some(AcquiringPermission),
        (Capturing, Command::BeginRecording) => Some(Recording),
        (Recording, Command::Pause) => Some(Paused),
        (Paused, Command::Resume) => Some(Recording),
        (Recording | Paused, Command::Stop) => Some(Stopping),
        (AcquiringPermission | Capturing | Recording | Paused | Stopping, Command::Cancel) => {
            Some(Cancelled)
        }
        (s, Command::Clear) if s.is_terminal() => Some(Idle),
        _ => None,
    }
}

/// One uninterrupted `Recording` interval
///
/// A new segment is opened each time recording begins or resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
    /// Segment index (0, 1, 2, ...)
    pub index: usize,

    /// Duration of this segment in milliseconds
    pub duration_ms: f64,

    /// Session time when the segment started
    pub process_time_start_ms: f64,

    /// Session time when the segment ended
    pub process_time_end_ms: f64,

    /// Unix timestamp when the segment started
    pub unix_start_ms: u64,

    /// Unix timestamp when the segment ended
    pub unix_end_ms: u64,

    /// Whether the segment has been closed
    pub closed: bool,
}

impl RecordingSegment {
    /// Open a segment starting now
    pub fn new(index: usize, process_time_ms: f64) -> Self {
        let now = Utc::now().timestamp_millis() as u64;
        Self {
            index,
            duration_ms: 0.0,
            process_time_start_ms: process_time_ms,
            process_time_end_ms: process_time_ms,
            unix_start_ms: now,
            unix_end_ms: now,
            closed: false,
        }
    }

    /// Close the segment. Closing twice keeps the first end time.
    pub fn end(&mut self, process_time_ms: f64) {
        if self.closed {
            return;
        }
        self.process_time_end_ms = process_time_ms.max(self.process_time_start_ms);
        self.duration_ms = self.process_time_end_ms - self.process_time_start_ms;
        self.unix_end_ms = Utc::now().timestamp_millis() as u64;
        self.closed = true;
    }

    /// Elapsed time, counting an open segment up to `process_time_ms`
    pub fn elapsed_ms(&self, process_time_ms: f64) -> f64 {
        if self.closed {
            self.duration_ms
        } else {
            (process_time_ms - self.process_time_start_ms).max(0.0)
        }
    }
}

/// Point-in-time view of a session for callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Option<String>,
    pub state: SessionState,
    pub device: Option<DeviceDescriptor>,
    pub duration_ms: f64,
    pub byte_size: u64,
    pub chunk_count: usize,
    pub segments: Vec<RecordingSegment>,
    pub mime_type: Option<String>,
    pub last_error: Option<ReportedError>,
    pub has_artifact: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use SessionState::*;

        assert_eq!(transition(Idle, Command::Start), Some(AcquiringPermission));
        assert_eq!(transition(Stopped, Command::Start), Some(AcquiringPermission));
        assert_eq!(transition(Recording, Command::Start), None);
        assert_eq!(transition(Capturing, Command::BeginRecording), Some(Recording));
        assert_eq!(transition(Recording, Command::Pause), Some(Paused));
        assert_eq!(transition(Paused, Command::Pause), None);
        assert_eq!(transition(Paused, Command::Resume), Some(Recording));
        assert_eq!(transition(Capturing, Command::Stop), None);
        assert_eq!(transition(Paused, Command::Stop), Some(Stopping));
        assert_eq!(transition(Stopping, Command::Cancel), Some(Cancelled));
        assert_eq!(transition(Idle, Command::Cancel), None);
        assert_eq!(transition(Failed, Command::Cancel), None);
        assert_eq!(transition(Cancelled, Command::Clear), Some(Idle));
    }

    #[test]
    fn test_segment_duration() {
        let mut segment = RecordingSegment::new(0, 250.0);
        assert_eq!(segment.elapsed_ms(1250.0), 1000.0);

        segment.end(1250.0);
        segment.end(9000.0);

        assert!(segment.closed);
        assert_eq!(segment.duration_ms, 1000.0);
        assert_eq!(segment.elapsed_ms(9000.0), 1000.0);
    }

    #[test]
    fn test_state_serializes_kebab_case() {
        let json = serde_json::to_string(&SessionState::AcquiringPermission).unwrap();
        assert_eq!(json, "\"acquiring-permission\"");
    }
}
