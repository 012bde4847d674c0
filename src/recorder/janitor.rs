//! Deterministic teardown
//!
//! Releases everything a session acquired. Runs on every transition into a
//! terminal state, on device switches (stream part only) and on disposal.

use super::artifact::ArtifactStore;
use super::session::CaptureSession;
use crate::capture::acquisition::StreamAcquisition;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// What a cleanup pass actually did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sampling_stopped: bool,
    pub duration_timers_stopped: bool,
    pub recorder_detached: bool,
    pub stream_released: bool,
    pub analyser_closed: bool,
    pub waiter_dropped: bool,
    pub handles_revoked: usize,
}

impl CleanupReport {
    /// Nothing was left to release
    pub fn is_noop(&self) -> bool {
        *self == CleanupReport::default()
    }
}

pub struct ResourceJanitor {
    acquisition: Arc<StreamAcquisition>,
    store: Arc<dyn ArtifactStore>,
}

impl ResourceJanitor {
    pub fn new(acquisition: Arc<StreamAcquisition>, store: Arc<dyn ArtifactStore>) -> Self {
        Self { acquisition, store }
    }

    /// Release every resource held by `session`
    ///
    /// Each step runs even if an earlier one failed. Calling this on a
    /// clean session does nothing.
    pub fn cleanup(&self, session: &mut CaptureSession) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Some(mut sampling) = session.sampling.take() {
            sampling.stop();
            report.sampling_stopped = true;
        }

        if let Some(mut progress) = session.progress.take() {
            progress.stop();
            report.duration_timers_stopped = true;
        }
        if let Some(mut deadline) = session.max_duration.take() {
            deadline.disarm();
            report.duration_timers_stopped = true;
        }

        if let Some(recorder) = session.recorder.take() {
            guarded("detach recorder", move || drop(recorder));
            report.recorder_detached = true;
        }

        self.release_stream(session, &mut report);

        if let Some(waiter) = session.flush_waiter.take() {
            drop(waiter);
            report.waiter_dropped = true;
        }

        for handle in std::mem::take(&mut session.stale_handles) {
            if self.store.revoke(&handle) {
                report.handles_revoked += 1;
            }
        }

        if !report.is_noop() {
            tracing::debug!(
                "Cleaned up session {:?} ({}): {:?}",
                session.id,
                session.state,
                report
            );
        }
        report
    }

    /// Stop sampling, release the stream and close the analyser, leaving
    /// the recorder, timers and chunks alone
    pub fn release_binding(&self, session: &mut CaptureSession) -> CleanupReport {
        let mut report = CleanupReport::default();
        if let Some(mut sampling) = session.sampling.take() {
            sampling.stop();
            report.sampling_stopped = true;
        }
        self.release_stream(session, &mut report);
        report
    }

    fn release_stream(&self, session: &mut CaptureSession, report: &mut CleanupReport) {
        if let Some(stream) = session.stream.take() {
            let acquisition = &self.acquisition;
            if let Some(released) = guarded("release stream", || acquisition.release(&stream)) {
                report.stream_released = released;
            }
            if let Some(device) = session.device.as_mut() {
                device.bound = false;
            }
        }

        if let Some(mut analyser) = session.analyser.take() {
            match guarded("close analyser", || analyser.close()) {
                Some(Ok(())) => report.analyser_closed = true,
                Some(Err(e)) => tracing::warn!("Failed to close analyser: {}", e),
                None => {}
            }
        }
    }
}

/// Run one teardown step, containing adapter panics
fn guarded<R>(step: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!("Cleanup step '{}' panicked; continuing", step);
            None
        }
    }
}
