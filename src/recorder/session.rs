//! Capture session
//!
//! One value per recording attempt, exclusively owned by the controller.
//! Every timer, stream and analyser a session acquires lives here, so the
//! janitor can always find and release all of them.

use super::artifact::{Artifact, ArtifactHandle};
use super::chunks::ChunkBuffer;
use super::reporter::ReportedError;
use super::sampling::SampleHistory;
use super::state::{RecordingSegment, SessionSnapshot, SessionState};
use super::timers::{Deadline, Ticker};
use crate::capture::acquisition::BoundStream;
use crate::capture::traits::{Analyser, Constraints, DeviceDescriptor, RecorderHandle};
use crate::utils::error::CaptureError;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub struct CaptureSession {
    pub(crate) id: Option<String>,
    pub(crate) state: SessionState,
    pub(crate) constraints: Constraints,
    pub(crate) device: Option<DeviceDescriptor>,

    /// Session clock origin, set by `start`
    pub(crate) started_at: Option<Instant>,
    pub(crate) segments: Vec<RecordingSegment>,
    pub(crate) chunks: ChunkBuffer,
    pub(crate) mime_type: Option<String>,
    pub(crate) artifact: Option<Artifact>,
    pub(crate) last_error: Option<ReportedError>,
    pub(crate) failure: Option<CaptureError>,
    pub(crate) history: SampleHistory,

    /// Bumped whenever a new stream or recorder is bound; events carrying
    /// an older generation are ignored
    pub(crate) stream_generation: u64,
    pub(crate) recorder_generation: u64,

    pub(crate) stream: Option<BoundStream>,
    pub(crate) recorder: Option<Box<dyn RecorderHandle>>,
    pub(crate) analyser: Option<Box<dyn Analyser>>,
    pub(crate) sampling: Option<Ticker>,
    pub(crate) progress: Option<Ticker>,
    pub(crate) max_duration: Option<Deadline>,
    pub(crate) flush_waiter: Option<oneshot::Sender<()>>,

    /// Artifact handles to revoke on the next cleanup
    pub(crate) stale_handles: Vec<ArtifactHandle>,

    /// A device switch is in flight
    pub(crate) switching: bool,

    /// The previous recorder is flushing during a device switch
    pub(crate) switch_flush: bool,
}

impl CaptureSession {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            id: None,
            state: SessionState::Idle,
            constraints: Constraints::default(),
            device: None,
            started_at: None,
            segments: Vec::new(),
            chunks: ChunkBuffer::new(),
            mime_type: None,
            artifact: None,
            last_error: None,
            failure: None,
            history: SampleHistory::new(history_capacity),
            stream_generation: 0,
            recorder_generation: 0,
            stream: None,
            recorder: None,
            analyser: None,
            sampling: None,
            progress: None,
            max_duration: None,
            flush_waiter: None,
            stale_handles: Vec::new(),
            switching: false,
            switch_flush: false,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn is_session(&self, id: &str) -> bool {
        self.id.as_deref() == Some(id)
    }

    /// Milliseconds since `start`
    pub(crate) fn process_time_ms(&self) -> f64 {
        self.started_at
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    /// Time spent recording, excluding pauses
    pub fn duration_ms(&self) -> f64 {
        let now = self.process_time_ms();
        self.segments.iter().map(|s| s.elapsed_ms(now)).sum()
    }

    pub fn byte_size(&self) -> u64 {
        self.chunks.byte_size()
    }

    /// State chunks are validated against; a switch flush counts as stopping
    pub(crate) fn chunk_state(&self) -> SessionState {
        if self.switch_flush {
            SessionState::Stopping
        } else {
            self.state
        }
    }

    pub(crate) fn open_segment(&mut self) {
        let index = self.segments.len();
        let now = self.process_time_ms();
        self.segments.push(RecordingSegment::new(index, now));
    }

    pub(crate) fn close_segment(&mut self) {
        let now = self.process_time_ms();
        if let Some(segment) = self.segments.last_mut() {
            segment.end(now);
        }
    }

    /// No timer, stream, analyser, recorder or waiter is attached
    pub fn is_clean(&self) -> bool {
        self.stream.is_none()
            && self.recorder.is_none()
            && self.analyser.is_none()
            && self.sampling.is_none()
            && self.progress.is_none()
            && self.max_duration.is_none()
            && self.flush_waiter.is_none()
            && self.stale_handles.is_empty()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state,
            device: self.device.clone(),
            duration_ms: self.duration_ms(),
            byte_size: self.byte_size(),
            chunk_count: self.chunks.len(),
            segments: self.segments.clone(),
            mime_type: self.mime_type.clone(),
            last_error: self.last_error.clone(),
            has_artifact: self.artifact.is_some(),
        }
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("byte_size", &self.byte_size())
            .field("segments", &self.segments.len())
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_duration_excludes_gaps_between_segments() {
        let mut session = CaptureSession::new(10);
        session.started_at = Some(Instant::now());

        session.open_segment();
        tokio::time::advance(Duration::from_millis(1000)).await;
        session.close_segment();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(session.duration_ms(), 1000.0);

        session.open_segment();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(session.duration_ms(), 1250.0);
    }

    #[test]
    fn test_fresh_session_is_clean() {
        let session = CaptureSession::new(10);
        assert!(session.is_clean());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.duration_ms(), 0.0);
    }
}
