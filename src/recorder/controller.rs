//! Recording controller
//!
//! Owns the single capture session and is the only place that mutates it.
//! Caller commands, native recorder events and timer ticks all enter here
//! and are checked against the transition table before anything changes.

use super::artifact::{Artifact, ArtifactStore, MemoryArtifactStore};
use super::config::EngineConfig;
use super::events::{EngineEvent, Notification, Publisher};
use super::janitor::{CleanupReport, ResourceJanitor};
use super::reporter::{ErrorReporter, ReportedError};
use super::sampling::{sample_once, AnalyticsSample};
use super::session::CaptureSession;
use super::state::{transition, Command, SessionSnapshot, SessionState};
use super::timers::{Deadline, Ticker};
use crate::capture::acquisition::{BindingTable, StreamAcquisition};
use crate::capture::devices::DeviceRegistry;
use crate::capture::traits::{
    CaptureBackend, Constraints, DeviceDescriptor, DeviceKind, EventSink, NativeEvent,
    PermissionStatus, RecorderOptions,
};
use crate::utils::error::{CaptureError, CaptureResult, PlatformError, PlatformErrorCode};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

struct Shared {
    config: EngineConfig,
    session: Mutex<CaptureSession>,

    /// Held by `start`, `stop` and `switch_device` while they await
    gate: tokio::sync::Mutex<()>,

    /// Device picked with `switch_device` between sessions
    preferred_device: Mutex<Option<String>>,

    registry: DeviceRegistry,
    acquisition: Arc<StreamAcquisition>,
    janitor: ResourceJanitor,
    store: Arc<dyn ArtifactStore>,
    publisher: Publisher,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        self.janitor.cleanup(session);
    }
}

/// Where a native event came from
#[derive(Debug, Clone, Copy)]
enum Origin {
    Stream(u64),
    Recorder(u64),
}

/// Event sink handed to the adapter for one stream or recorder binding
struct SessionSink {
    shared: Weak<Shared>,
    session_id: String,
    origin: Origin,
}

impl EventSink for SessionSink {
    fn emit(&self, event: NativeEvent) {
        if let Some(shared) = self.shared.upgrade() {
            RecordingController { shared }.handle_native(&self.session_id, self.origin, event);
        }
    }
}

/// Drives one capture session at a time against a source adapter
#[derive(Clone)]
pub struct RecordingController {
    shared: Arc<Shared>,
}

impl RecordingController {
    /// Create a controller with an in-memory artifact store
    ///
    /// Controllers built on the same adapter share its device bindings, so
    /// two engines never hold the same source at once.
    pub fn new(backend: Arc<dyn CaptureBackend>, config: EngineConfig) -> Self {
        Self::with_store(backend, config, Arc::new(MemoryArtifactStore::new()))
    }

    pub fn with_store(
        backend: Arc<dyn CaptureBackend>,
        config: EngineConfig,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let bindings = backend.bindings().clone();
        Self::with_bindings(backend, config, store, bindings)
    }

    /// Create a controller with an explicit binding table, for adapters
    /// that reach the same hardware through separate instances
    pub fn with_bindings(
        backend: Arc<dyn CaptureBackend>,
        config: EngineConfig,
        store: Arc<dyn ArtifactStore>,
        bindings: BindingTable,
    ) -> Self {
        let acquisition = Arc::new(StreamAcquisition::new(backend.clone(), bindings.clone()));
        let janitor = ResourceJanitor::new(acquisition.clone(), store.clone());
        let publisher = Publisher::new(config.event_capacity);

        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(CaptureSession::new(config.history_capacity)),
                gate: tokio::sync::Mutex::new(()),
                preferred_device: Mutex::new(None),
                registry: DeviceRegistry::new(backend, bindings),
                acquisition,
                janitor,
                store,
                publisher,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.shared.store
    }

    fn backend(&self) -> &Arc<dyn CaptureBackend> {
        self.shared.acquisition.backend()
    }

    /// Run `f` with the session locked, then publish what it queued
    fn with_session<R>(&self, f: impl FnOnce(&mut CaptureSession, &mut Vec<Notification>) -> R) -> R {
        let mut notes = Vec::new();
        let result = {
            let mut session = self.shared.session.lock();
            f(&mut session, &mut notes)
        };
        self.shared.publisher.publish(notes);
        result
    }

    fn set_state(session: &mut CaptureSession, to: SessionState, notes: &mut Vec<Notification>) {
        let from = session.state;
        if from == to {
            return;
        }
        session.state = to;

        let session_id = session.id.clone().unwrap_or_default();
        tracing::info!("Session {} {} -> {}", session_id, from, to);
        notes.push(Notification::Event(EngineEvent::StateChanged { session_id, from, to }));
    }

    fn sink(&self, session_id: &str, origin: Origin) -> Arc<dyn EventSink> {
        Arc::new(SessionSink {
            shared: Arc::downgrade(&self.shared),
            session_id: session_id.to_string(),
            origin,
        })
    }

    fn reject(command: Command, state: SessionState) -> CaptureError {
        CaptureError::InvalidTransition { command, state }
    }

    /// Move a live session into `Failed`, releasing everything it holds
    fn fail(
        &self,
        session: &mut CaptureSession,
        error: CaptureError,
        origin: Option<&PlatformError>,
        notes: &mut Vec<Notification>,
    ) {
        if session.state.is_terminal() || session.state == SessionState::Idle {
            return;
        }

        if session.state == SessionState::Recording {
            session.close_segment();
        }
        session.chunks.discard();
        session.artifact = None;

        let reported = ErrorReporter::report(&error, origin);
        session.last_error = Some(reported.clone());
        session.failure = Some(error);

        self.shared.janitor.cleanup(session);
        Self::set_state(session, SessionState::Failed, notes);
        notes.push(Notification::Error(reported));
    }

    /// Classify and apply an adapter failure, returning the engine error
    fn fail_platform(
        &self,
        session: &mut CaptureSession,
        error: &PlatformError,
        notes: &mut Vec<Notification>,
    ) -> CaptureError {
        let classified = ErrorReporter::classify(error);
        self.fail(session, classified.clone(), Some(error), notes);
        classified
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.shared.session.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.session.lock().snapshot()
    }

    /// Recorded time, excluding pauses
    pub fn duration(&self) -> Duration {
        let ms = self.shared.session.lock().duration_ms();
        Duration::from_secs_f64(ms / 1000.0)
    }

    pub fn byte_size(&self) -> u64 {
        self.shared.session.lock().byte_size()
    }

    /// The artifact, present only while the session is `Stopped`
    pub fn artifact(&self) -> Option<Artifact> {
        self.shared.session.lock().artifact.clone()
    }

    pub fn last_error(&self) -> Option<ReportedError> {
        self.shared.session.lock().last_error.clone()
    }

    /// Device bound to the current session
    pub fn describe_current(&self) -> Option<DeviceDescriptor> {
        self.shared.session.lock().device.clone()
    }

    /// Rolling sample history, oldest first
    pub fn history(&self) -> Vec<AnalyticsSample> {
        self.shared.session.lock().history.to_vec()
    }

    pub fn latest_sample(&self) -> Option<AnalyticsSample> {
        self.shared.session.lock().history.latest().cloned()
    }

    pub async fn list_devices(&self, kind: DeviceKind) -> CaptureResult<Vec<DeviceDescriptor>> {
        self.shared.registry.list_devices(kind).await
    }

    pub async fn permission_status(&self, kind: DeviceKind) -> PermissionStatus {
        self.shared.registry.permission_status(kind).await
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.publisher.subscribe()
    }

    pub fn on_sample<F>(&self, callback: F)
    where
        F: Fn(&AnalyticsSample) + Send + Sync + 'static,
    {
        self.shared.publisher.on_sample(callback);
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&ReportedError) + Send + Sync + 'static,
    {
        self.shared.publisher.on_error(callback);
    }

    pub fn on_artifact_ready<F>(&self, callback: F)
    where
        F: Fn(&Artifact) + Send + Sync + 'static,
    {
        self.shared.publisher.on_artifact_ready(callback);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Start a session with the configured constraints
    pub async fn start(&self) -> CaptureResult<()> {
        let mut constraints = self.shared.config.constraints.clone();
        if let Some(device_id) = self.shared.preferred_device.lock().clone() {
            constraints.device_id = Some(device_id);
        }
        self.start_with(constraints).await
    }

    /// Start a session: acquire a stream and begin sampling it
    ///
    /// Rejected immediately unless the engine is idle or the previous
    /// session has ended; an in-flight session is never reset.
    pub async fn start_with(&self, constraints: Constraints) -> CaptureResult<()> {
        let state = self.state();
        if !state.can_start() {
            return Err(Self::reject(Command::Start, state));
        }
        let Ok(_gate) = self.shared.gate.try_lock() else {
            return Err(CaptureError::Busy(Command::Start));
        };

        let session_id = Uuid::new_v4().to_string();
        let sink = self.with_session(|session, notes| {
            let mut previous = std::mem::replace(
                session,
                CaptureSession::new(self.shared.config.history_capacity),
            );
            if let Some(artifact) = previous.artifact.take() {
                previous.stale_handles.push(artifact.handle().clone());
            }
            self.shared.janitor.cleanup(&mut previous);

            session.id = Some(session_id.clone());
            session.state = previous.state;
            session.constraints = constraints.clone();
            session.started_at = Some(Instant::now());
            session.stream_generation = 1;
            Self::set_state(session, SessionState::AcquiringPermission, notes);

            self.sink(&session_id, Origin::Stream(1))
        });

        let acquired = self
            .shared
            .acquisition
            .acquire(&constraints, &session_id, sink)
            .await;

        let device = match &acquired {
            Ok(stream) => self
                .shared
                .registry
                .find(constraints.kind, stream.device_id())
                .await
                .ok()
                .flatten(),
            Err(_) => None,
        };

        self.with_session(|session, notes| {
            if !session.is_session(&session_id) || session.state != SessionState::AcquiringPermission {
                if let Ok(stream) = &acquired {
                    self.shared.acquisition.release(stream);
                }
                tracing::debug!("Session {} ended while acquiring its stream", session_id);
                return Err(CaptureError::Cancelled);
            }

            let stream = match acquired {
                Ok(stream) => stream,
                Err(error) => {
                    self.fail(session, error.clone(), None, notes);
                    return Err(error);
                }
            };

            session.device = Some(device.unwrap_or_else(|| DeviceDescriptor {
                id: stream.device_id().to_string(),
                label: stream.label().to_string(),
                kind: constraints.kind,
                is_default: false,
                bound: true,
            }));
            if let Some(device) = session.device.as_mut() {
                device.bound = true;
            }

            session.stream = Some(stream);
            self.attach_sampling(session);
            Self::set_state(session, SessionState::Capturing, notes);
            Ok(())
        })
    }

    /// Open an analyser on the bound stream and start the sampling loop
    fn attach_sampling(&self, session: &mut CaptureSession) {
        let Some(stream) = session.stream.as_ref() else {
            return;
        };

        match self.backend().open_analyser(stream.shared()) {
            Ok(analyser) => session.analyser = Some(analyser),
            Err(e) => {
                tracing::warn!("Sampling unavailable for {}: {}", stream.device_id(), e);
                return;
            }
        }

        let weak = Arc::downgrade(&self.shared);
        let session_id = session.id.clone().unwrap_or_default();
        let generation = session.stream_generation;

        session.sampling = Some(Ticker::spawn(
            "sampling",
            self.shared.config.sample_interval(),
            move || match weak.upgrade() {
                Some(shared) => RecordingController { shared }.sample_tick(&session_id, generation),
                None => false,
            },
        ));
    }

    /// One sampling loop iteration. Returns `false` once the stream is gone.
    fn sample_tick(&self, session_id: &str, generation: u64) -> bool {
        self.with_session(|session, notes| {
            if !session.is_session(session_id)
                || session.stream_generation != generation
                || !session.state.holds_stream()
            {
                return false;
            }

            let at_ms = session.process_time_ms();
            let Some(analyser) = session.analyser.as_mut() else {
                return false;
            };

            if let Some(sample) = sample_once(analyser.as_mut(), at_ms) {
                session.history.push(sample.clone());
                notes.push(Notification::Sample(sample));
            }
            true
        })
    }

    /// Attach the recorder primitive and start recording
    pub fn begin_recording(&self) -> CaptureResult<()> {
        self.with_session(|session, notes| {
            let state = session.state;
            if transition(state, Command::BeginRecording).is_none() {
                return Err(Self::reject(Command::BeginRecording, state));
            }
            if session.switching {
                return Err(CaptureError::DeviceBusy("a device switch is in progress".into()));
            }

            let kind = session.constraints.kind;
            let supported = self.backend().supported_mime_types(kind);
            let Some((mime_type, fell_back)) =
                self.shared.config.negotiate_mime_type(kind, &supported)
            else {
                let error = CaptureError::UnsupportedFormat(format!(
                    "{} supports no {} encodings",
                    self.backend().name(),
                    kind
                ));
                self.fail(session, error.clone(), None, notes);
                return Err(error);
            };

            if fell_back {
                let requested = self
                    .shared
                    .config
                    .preferred_mime_type
                    .clone()
                    .unwrap_or_default();
                let notice = CaptureError::UnsupportedFormat(format!(
                    "{} is not available, recording as {}",
                    requested, mime_type
                ));
                notes.push(Notification::Event(EngineEvent::FormatFallback {
                    requested,
                    chosen: mime_type.clone(),
                }));
                notes.push(Notification::Error(ErrorReporter::report(&notice, None)));
            }

            let Some(stream) = session.stream.as_ref() else {
                let error = CaptureError::DeviceDisconnected("no stream is bound".into());
                self.fail(session, error.clone(), None, notes);
                return Err(error);
            };

            let options = RecorderOptions {
                mime_type: mime_type.clone(),
                timeslice_ms: self.shared.config.timeslice_ms,
                bits_per_second: self.shared.config.bits_per_second,
            };

            let generation = session.recorder_generation + 1;
            let session_id = session.id.clone().unwrap_or_default();
            let sink = self.sink(&session_id, Origin::Recorder(generation));

            let mut recorder = match self.backend().attach_recorder(stream.shared(), &options, sink) {
                Ok(recorder) => recorder,
                Err(e) => return Err(self.fail_platform(session, &e, notes)),
            };
            if let Err(e) = recorder.start() {
                return Err(self.fail_platform(session, &e, notes));
            }

            session.recorder_generation = generation;
            session.mime_type = Some(recorder.mime_type().to_string());
            session.recorder = Some(recorder);
            session.open_segment();
            Self::set_state(session, SessionState::Recording, notes);
            self.arm_duration_timers(session);
            Ok(())
        })
    }

    /// Start the progress ticker and the max-duration deadline for the
    /// remaining recording budget
    fn arm_duration_timers(&self, session: &mut CaptureSession) {
        let session_id = session.id.clone().unwrap_or_default();

        let weak = Arc::downgrade(&self.shared);
        let id = session_id.clone();
        session.progress = Some(Ticker::spawn(
            "progress",
            self.shared.config.progress_interval(),
            move || match weak.upgrade() {
                Some(shared) => RecordingController { shared }.progress_tick(&id),
                None => false,
            },
        ));

        if let Some(max) = self.shared.config.max_duration() {
            let remaining_ms = (max.as_secs_f64() * 1000.0 - session.duration_ms()).max(0.0);
            let remaining = Duration::from_secs_f64(remaining_ms / 1000.0);
            let weak = Arc::downgrade(&self.shared);

            session.max_duration = Some(Deadline::spawn(remaining, move || async move {
                if let Some(shared) = weak.upgrade() {
                    RecordingController { shared }
                        .max_duration_reached(&session_id)
                        .await;
                }
            }));
        }
    }

    fn disarm_duration_timers(session: &mut CaptureSession) {
        if let Some(mut progress) = session.progress.take() {
            progress.stop();
        }
        if let Some(mut deadline) = session.max_duration.take() {
            deadline.disarm();
        }
    }

    fn progress_tick(&self, session_id: &str) -> bool {
        self.with_session(|session, notes| {
            if !session.is_session(session_id) || session.state != SessionState::Recording {
                return false;
            }
            notes.push(Notification::Event(EngineEvent::Progress {
                session_id: session_id.to_string(),
                duration_ms: session.duration_ms(),
                byte_size: session.byte_size(),
            }));
            true
        })
    }

    async fn max_duration_reached(&self, session_id: &str) {
        let armed = self.with_session(|session, _| {
            if !session.is_session(session_id) || session.state != SessionState::Recording {
                return false;
            }
            // This task is the deadline's own; stopping must not abort it
            if let Some(mut deadline) = session.max_duration.take() {
                deadline.detach();
            }
            true
        });
        if !armed {
            return;
        }

        tracing::info!("Session {} reached its maximum duration", session_id);
        let Ok(_gate) = self.shared.gate.try_lock() else {
            tracing::debug!("Another command is in flight; skipping automatic stop");
            return;
        };
        if let Err(e) = self.stop_locked().await {
            tracing::debug!("Automatic stop did not produce an artifact: {}", e);
        }
    }

    /// Pause the recorder. Sampling continues.
    pub fn pause(&self) -> CaptureResult<()> {
        self.with_session(|session, notes| {
            let state = session.state;
            if transition(state, Command::Pause).is_none() {
                return Err(Self::reject(Command::Pause, state));
            }

            if let Some(recorder) = session.recorder.as_mut() {
                if let Err(e) = recorder.pause() {
                    return Err(self.fail_platform(session, &e, notes));
                }
            }

            session.close_segment();
            Self::disarm_duration_timers(session);
            Self::set_state(session, SessionState::Paused, notes);
            Ok(())
        })
    }

    pub fn resume(&self) -> CaptureResult<()> {
        self.with_session(|session, notes| {
            let state = session.state;
            if transition(state, Command::Resume).is_none() {
                return Err(Self::reject(Command::Resume, state));
            }
            if session.switching {
                return Err(CaptureError::DeviceBusy("a device switch is in progress".into()));
            }

            if let Some(recorder) = session.recorder.as_mut() {
                if let Err(e) = recorder.resume() {
                    return Err(self.fail_platform(session, &e, notes));
                }
            }

            session.open_segment();
            Self::set_state(session, SessionState::Recording, notes);
            self.arm_duration_timers(session);
            Ok(())
        })
    }

    /// Stop recording and wait for the artifact
    ///
    /// Waits for the recorder's final flush before assembling the
    /// artifact, so the last chunk is never lost. A `cancel` issued while
    /// the flush is pending wins and this returns [`CaptureError::Cancelled`].
    pub async fn stop(&self) -> CaptureResult<Artifact> {
        let state = self.state();
        if transition(state, Command::Stop).is_none() {
            return Err(Self::reject(Command::Stop, state));
        }
        let Ok(_gate) = self.shared.gate.try_lock() else {
            return Err(CaptureError::Busy(Command::Stop));
        };
        self.stop_locked().await
    }

    /// Body of `stop`; the caller holds the command gate
    async fn stop_locked(&self) -> CaptureResult<Artifact> {
        let begun = self.with_session(|session, notes| {
            let state = session.state;
            if transition(state, Command::Stop).is_none() {
                return Err(Self::reject(Command::Stop, state));
            }

            if state == SessionState::Recording {
                session.close_segment();
            }
            Self::disarm_duration_timers(session);

            let (tx, rx) = oneshot::channel();
            session.flush_waiter = Some(tx);
            let recorder = session.recorder.take();
            Self::set_state(session, SessionState::Stopping, notes);

            Ok((session.id.clone().unwrap_or_default(), recorder, rx))
        });
        let (session_id, mut recorder, flushed) = begun?;

        // Flush data arrives through the sink, which needs the session lock
        let stop_result = match recorder.as_mut() {
            Some(recorder) => recorder.stop(),
            None => Ok(()),
        };

        if let Err(e) = stop_result {
            return self.with_session(|session, notes| {
                if session.is_session(&session_id) && session.state == SessionState::Stopping {
                    Err(self.fail_platform(session, &e, notes))
                } else {
                    Err(CaptureError::Cancelled)
                }
            });
        }

        let wait = if recorder.is_some() {
            Some(tokio::time::timeout(self.shared.config.flush_timeout(), flushed).await)
        } else {
            None
        };
        drop(recorder);

        self.with_session(|session, notes| {
            if !session.is_session(&session_id) {
                return Err(CaptureError::Cancelled);
            }
            match session.state {
                SessionState::Stopping => {}
                SessionState::Failed => {
                    return Err(session.failure.clone().unwrap_or(CaptureError::Cancelled));
                }
                _ => return Err(CaptureError::Cancelled),
            }

            match wait {
                Some(Err(_)) => tracing::warn!(
                    "Recorder did not flush within {:?}; finalizing {} chunk(s)",
                    self.shared.config.flush_timeout(),
                    session.chunks.len()
                ),
                Some(Ok(Err(_))) => tracing::warn!("Recorder flush signal was dropped"),
                _ => {}
            }
            session.flush_waiter = None;

            let mime_type = session
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let artifact = match session.chunks.finalize(&mime_type, self.shared.store.as_ref()) {
                Ok(artifact) => artifact.with_duration(session.duration_ms()),
                Err(error) => {
                    self.fail(session, error.clone(), None, notes);
                    return Err(error);
                }
            };

            session.artifact = Some(artifact.clone());
            self.shared.janitor.cleanup(session);
            Self::set_state(session, SessionState::Stopped, notes);

            tracing::info!(
                "Recording finished: {} bytes, {:.0}ms",
                artifact.len(),
                artifact.duration_ms()
            );
            notes.push(Notification::Artifact(artifact.clone()));
            Ok(artifact)
        })
    }

    /// Abandon the session without producing an artifact
    ///
    /// Available from every live state, including while `stop` waits for
    /// the final flush.
    pub fn cancel(&self) -> CaptureResult<()> {
        self.with_session(|session, notes| {
            let state = session.state;
            if transition(state, Command::Cancel).is_none() {
                return Err(Self::reject(Command::Cancel, state));
            }
            self.cancel_locked(session, notes);
            Ok(())
        })
    }

    fn cancel_locked(&self, session: &mut CaptureSession, notes: &mut Vec<Notification>) {
        if session.state == SessionState::Recording {
            session.close_segment();
        }
        session.chunks.discard();
        session.artifact = None;

        self.shared.janitor.cleanup(session);
        Self::set_state(session, SessionState::Cancelled, notes);
    }

    /// Bind a different device
    ///
    /// Between sessions this picks the device for the next `start`. While
    /// `Capturing` or `Paused` the live stream is replaced; while
    /// `Recording` it fails with [`CaptureError::DeviceBusy`] and leaves the
    /// session untouched.
    pub async fn switch_device(&self, device_id: &str) -> CaptureResult<()> {
        let (state, session_id, constraints, current) = {
            let session = self.shared.session.lock();
            (
                session.state,
                session.id.clone().unwrap_or_default(),
                session.constraints.clone(),
                session.device.as_ref().map(|d| d.id.clone()),
            )
        };

        match state {
            SessionState::Recording | SessionState::AcquiringPermission | SessionState::Stopping => {
                return Err(CaptureError::DeviceBusy(format!(
                    "cannot switch devices while {}",
                    state
                )));
            }
            SessionState::Capturing | SessionState::Paused => {}
            _ => {
                let kind = self.shared.config.constraints.kind;
                if self.shared.registry.find(kind, device_id).await?.is_none() {
                    return Err(CaptureError::DeviceNotFound(device_id.to_string()));
                }
                *self.shared.preferred_device.lock() = Some(device_id.to_string());
                tracing::info!("Next session will use {}", device_id);
                return Ok(());
            }
        }

        if current.as_deref() == Some(device_id) {
            return Ok(());
        }

        let Ok(_gate) = self.shared.gate.try_lock() else {
            return Err(CaptureError::DeviceBusy("another command is in progress".into()));
        };

        let generation = self.with_session(|session, _| {
            if !session.is_session(&session_id) || session.state != state || session.switching {
                return Err(CaptureError::DeviceBusy("session changed during switch".into()));
            }
            session.switching = true;
            Ok(session.stream_generation + 1)
        })?;

        let result = self.rebind(&session_id, generation, constraints.with_device(device_id)).await;

        self.with_session(|session, _| {
            if session.is_session(&session_id) {
                session.switching = false;
            }
        });
        result
    }

    async fn rebind(&self, session_id: &str, generation: u64, constraints: Constraints) -> CaptureResult<()> {
        let sink = self.sink(session_id, Origin::Stream(generation));
        let stream = self
            .shared
            .acquisition
            .acquire(&constraints, session_id, sink)
            .await?;

        let device = self
            .shared
            .registry
            .find(constraints.kind, stream.device_id())
            .await
            .ok()
            .flatten();

        // A paused recorder is bound to the old stream: flush it first
        let old_recorder = self.with_session(|session, _| {
            if !session.is_session(session_id) || !session.state.holds_stream() {
                return Err(CaptureError::Cancelled);
            }
            let recorder = session.recorder.take();
            if recorder.is_some() {
                let (tx, rx) = oneshot::channel();
                session.flush_waiter = Some(tx);
                session.switch_flush = true;
                Ok(Some((recorder, rx)))
            } else {
                Ok(None)
            }
        });

        let old_recorder = match old_recorder {
            Ok(old) => old,
            Err(e) => {
                self.shared.acquisition.release(&stream);
                return Err(e);
            }
        };

        if let Some((mut recorder, flushed)) = old_recorder {
            if let Some(recorder) = recorder.as_mut() {
                if let Err(e) = recorder.stop() {
                    tracing::warn!("Previous recorder failed to stop cleanly: {}", e);
                }
            }
            if tokio::time::timeout(self.shared.config.flush_timeout(), flushed)
                .await
                .is_err()
            {
                tracing::warn!("Previous recorder did not flush before the switch");
            }
            drop(recorder);
        }

        self.with_session(|session, notes| {
            session.switch_flush = false;
            session.flush_waiter = None;

            if !session.is_session(session_id)
                || !matches!(session.state, SessionState::Capturing | SessionState::Paused)
            {
                self.shared.acquisition.release(&stream);
                return Err(CaptureError::Cancelled);
            }

            self.shared.janitor.release_binding(session);
            session.stream_generation = generation;
            session.device = Some(device.unwrap_or_else(|| DeviceDescriptor {
                id: stream.device_id().to_string(),
                label: stream.label().to_string(),
                kind: constraints.kind,
                is_default: false,
                bound: true,
            }));
            if let Some(device) = session.device.as_mut() {
                device.bound = true;
            }
            session.constraints = constraints.clone();
            session.stream = Some(stream);
            self.attach_sampling(session);

            if session.state == SessionState::Paused {
                if let Err(error) = self.reattach_paused_recorder(session) {
                    self.fail(session, error.clone(), None, notes);
                    return Err(error);
                }
            }

            if let Some(device) = session.device.clone() {
                tracing::info!("Session {} switched to {}", session_id, device.id);
                notes.push(Notification::Event(EngineEvent::DeviceChanged {
                    session_id: session_id.to_string(),
                    device,
                }));
            }
            Ok(())
        })
    }

    /// Attach a recorder to the new stream in the paused position
    fn reattach_paused_recorder(&self, session: &mut CaptureSession) -> CaptureResult<()> {
        let Some(stream) = session.stream.as_ref() else {
            return Err(CaptureError::DeviceDisconnected("no stream is bound".into()));
        };
        let mime_type = session.mime_type.clone().unwrap_or_default();
        let options = RecorderOptions {
            mime_type,
            timeslice_ms: self.shared.config.timeslice_ms,
            bits_per_second: self.shared.config.bits_per_second,
        };

        let generation = session.recorder_generation + 1;
        let session_id = session.id.clone().unwrap_or_default();
        let sink = self.sink(&session_id, Origin::Recorder(generation));

        let mut recorder = self
            .backend()
            .attach_recorder(stream.shared(), &options, sink)
            .map_err(|e| ErrorReporter::classify(&e))?;
        recorder
            .start()
            .and_then(|_| recorder.pause())
            .map_err(|e| ErrorReporter::classify(&e))?;

        session.recorder_generation = generation;
        session.recorder = Some(recorder);
        Ok(())
    }

    /// Drop a finished session and revoke its artifact handle
    pub fn clear(&self) -> CaptureResult<()> {
        self.with_session(|session, notes| {
            let state = session.state;
            if transition(state, Command::Clear).is_none() {
                return Err(Self::reject(Command::Clear, state));
            }
            self.reset_locked(session, notes);
            Ok(())
        })
    }

    fn reset_locked(&self, session: &mut CaptureSession, notes: &mut Vec<Notification>) {
        if let Some(artifact) = session.artifact.take() {
            session.stale_handles.push(artifact.handle().clone());
        }
        self.shared.janitor.cleanup(session);
        Self::set_state(session, SessionState::Idle, notes);
        *session = CaptureSession::new(self.shared.config.history_capacity);
    }

    /// Cancel any live session and release everything, including the
    /// artifact handle. The engine is left `Idle`.
    pub fn dispose(&self) -> CleanupReport {
        self.with_session(|session, notes| {
            let live = transition(session.state, Command::Cancel).is_some();
            if live {
                if session.state == SessionState::Recording {
                    session.close_segment();
                }
                session.chunks.discard();
            }
            if let Some(artifact) = session.artifact.take() {
                session.stale_handles.push(artifact.handle().clone());
            }

            let report = self.shared.janitor.cleanup(session);
            if live {
                Self::set_state(session, SessionState::Cancelled, notes);
            }
            if session.state != SessionState::Idle {
                Self::set_state(session, SessionState::Idle, notes);
                *session = CaptureSession::new(self.shared.config.history_capacity);
            }
            report
        })
    }

    /// Run the janitor on the current session
    ///
    /// Terminal transitions already do this, so on a finished session it
    /// reports no work.
    pub fn cleanup(&self) -> CleanupReport {
        let mut session = self.shared.session.lock();
        if session.state.holds_stream() || session.state == SessionState::AcquiringPermission {
            return CleanupReport::default();
        }
        self.shared.janitor.cleanup(&mut session)
    }

    /// Write the artifact to `path`
    pub async fn download(&self, path: impl AsRef<Path>) -> CaptureResult<PathBuf> {
        let artifact = {
            let session = self.shared.session.lock();
            match &session.artifact {
                Some(artifact) => artifact.clone(),
                None => return Err(Self::reject(Command::Download, session.state)),
            }
        };
        artifact.download(path).await
    }

    // ------------------------------------------------------------------
    // Native events
    // ------------------------------------------------------------------

    fn handle_native(&self, session_id: &str, origin: Origin, event: NativeEvent) {
        self.with_session(|session, notes| {
            if !session.is_session(session_id) {
                tracing::debug!("Ignoring event for stale session {}", session_id);
                return;
            }
            let current = match origin {
                Origin::Stream(generation) => generation == session.stream_generation,
                Origin::Recorder(generation) => generation == session.recorder_generation,
            };
            if !current {
                tracing::debug!("Ignoring event from replaced binding {:?}", origin);
                return;
            }

            match event {
                NativeEvent::Data(chunk) => self.on_chunk(session, chunk, notes),
                NativeEvent::RecorderStopped => {
                    if let Some(waiter) = session.flush_waiter.take() {
                        let _ = waiter.send(());
                    } else if matches!(session.state, SessionState::Recording | SessionState::Paused) {
                        let error = CaptureError::RecorderFault("recorder stopped unexpectedly".into());
                        self.fail(session, error, None, notes);
                    }
                }
                NativeEvent::RecorderError(error) => {
                    if !session.state.is_terminal() {
                        self.fail_platform(session, &error, notes);
                    }
                }
                NativeEvent::TrackEnded => {
                    if matches!(
                        session.state,
                        SessionState::Capturing | SessionState::Recording | SessionState::Paused
                    ) {
                        let label = session
                            .device
                            .as_ref()
                            .map(|d| d.label.clone())
                            .unwrap_or_else(|| "capture source".to_string());
                        let origin =
                            PlatformError::new(PlatformErrorCode::Ended, format!("{} ended", label));
                        self.fail_platform(session, &origin, notes);
                    }
                }
            }
        });
    }

    fn on_chunk(&self, session: &mut CaptureSession, chunk: Vec<u8>, notes: &mut Vec<Notification>) {
        if session.state.is_terminal() {
            tracing::debug!("Discarding {} byte chunk after {}", chunk.len(), session.state);
            return;
        }

        let len = chunk.len();
        let state = session.chunk_state();
        match session.chunks.append(state, chunk) {
            Ok(byte_size) => {
                notes.push(Notification::Event(EngineEvent::ChunkAppended {
                    session_id: session.id.clone().unwrap_or_default(),
                    len,
                    byte_size,
                }));

                if let Some(limit) = self.shared.config.max_bytes {
                    if byte_size > limit {
                        self.fail(session, CaptureError::MaxSizeExceeded { limit }, None, notes);
                    }
                }
            }
            Err(e) => {
                tracing::error!("Dropped {} byte chunk: {}", len, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::virtual_source::{RecorderPhase, VirtualBackend, VirtualRecorder};
    use crate::utils::error::{ErrorKind, RecoveryAction};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    fn engine(config: EngineConfig) -> (RecordingController, Arc<VirtualBackend>) {
        let backend = Arc::new(VirtualBackend::with_standard_devices());
        let controller = RecordingController::new(backend.clone(), config);
        (controller, backend)
    }

    async fn recording(
        config: EngineConfig,
    ) -> (RecordingController, Arc<VirtualBackend>, VirtualRecorder) {
        let (controller, backend) = engine(config);
        controller.start().await.unwrap();
        controller.begin_recording().unwrap();
        let recorder = backend.recorder().unwrap();
        (controller, backend, recorder)
    }

    async fn settle_until(controller: &RecordingController, state: SessionState) {
        for _ in 0..100 {
            if controller.state() == state {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("never reached {}, stuck in {}", state, controller.state());
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_excluded_from_duration() {
        let (controller, backend, recorder) = recording(EngineConfig::default()).await;

        recorder.emit(vec![1u8; 10]);
        recorder.emit(vec![2u8; 20]);
        recorder.emit(vec![3u8; 30]);
        advance(Duration::from_millis(1000)).await;

        controller.pause().unwrap();
        advance(Duration::from_millis(500)).await;
        controller.resume().unwrap();

        recorder.emit(vec![4u8; 5]);
        advance(Duration::from_millis(1000)).await;

        let artifact = controller.stop().await.unwrap();

        assert_eq!(controller.state(), SessionState::Stopped);
        assert_eq!(controller.byte_size(), 65);
        assert_eq!(controller.duration(), Duration::from_millis(2000));
        assert_eq!(artifact.len(), 65);
        assert_eq!(artifact.duration_ms(), 2000.0);
        assert_eq!(artifact.mime_type(), "audio/webm;codecs=opus");
        assert_eq!(&artifact.bytes()[..10], &[1u8; 10]);
        assert_eq!(&artifact.bytes()[60..], &[4u8; 5]);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.segments.len(), 2);
        assert!(snapshot.segments.iter().all(|s| s.closed));
        assert!(controller.store().is_live(artifact.handle()));

        let probe = backend.probe();
        assert_eq!(probe.tracks_stopped(), 1);
        assert_eq!(probe.analysers_closed(), 1);
    }

    #[tokio::test]
    async fn test_second_start_does_not_reset_live_session() {
        let (controller, backend, recorder) = recording(EngineConfig::default()).await;
        recorder.emit(vec![0u8; 10]);

        let result = controller.start().await;

        assert!(matches!(
            result,
            Err(CaptureError::InvalidTransition {
                command: Command::Start,
                state: SessionState::Recording,
            })
        ));
        assert_eq!(controller.state(), SessionState::Recording);
        assert_eq!(controller.byte_size(), 10);
        assert_eq!(backend.probe().streams_acquired(), 1);
    }

    #[tokio::test]
    async fn test_cancel_discards_and_releases() {
        let (controller, backend, recorder) = recording(EngineConfig::default()).await;
        recorder.emit(vec![0u8; 10]);

        controller.cancel().unwrap();

        assert_eq!(controller.state(), SessionState::Cancelled);
        assert!(controller.artifact().is_none());
        assert_eq!(controller.snapshot().chunk_count, 0);

        let probe = backend.probe();
        assert_eq!(probe.tracks_stopped(), 1);
        assert_eq!(probe.analysers_closed(), 1);

        assert!(matches!(
            controller.cancel(),
            Err(CaptureError::InvalidTransition { .. })
        ));
        assert!(controller.cleanup().is_noop());
    }

    #[tokio::test]
    async fn test_cleanup_after_stop_is_noop() {
        let (controller, backend, recorder) = recording(EngineConfig::default()).await;
        recorder.emit(vec![0u8; 4]);
        controller.stop().await.unwrap();

        assert!(controller.cleanup().is_noop());
        assert!(controller.cleanup().is_noop());
        assert_eq!(backend.probe().tracks_stopped(), 1);
        assert_eq!(recorder.phase(), RecorderPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_stops_exactly_once() {
        let config = EngineConfig::default().with_max_duration(Duration::from_secs(2));
        let (controller, _backend) = engine(config);
        let mut rx = controller.subscribe();

        controller.start().await.unwrap();
        controller.begin_recording().unwrap();

        advance(Duration::from_millis(2000)).await;
        settle_until(&controller, SessionState::Stopped).await;

        assert_eq!(controller.duration(), Duration::from_millis(2000));
        advance(Duration::from_millis(1000)).await;
        assert_eq!(controller.duration(), Duration::from_millis(2000));

        let artifact = controller.artifact().unwrap();
        assert_eq!(artifact.duration_ms(), 2000.0);

        let ready = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::ArtifactReady(_)))
            .count();
        assert_eq!(ready, 1);
        assert!(controller.stop().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_rejected_while_recording() {
        let (controller, _backend, recorder) = recording(EngineConfig::default()).await;
        recorder.emit(vec![0u8; 10]);
        advance(Duration::from_millis(500)).await;

        let result = controller.switch_device("mic-2").await;

        assert!(matches!(result, Err(CaptureError::DeviceBusy(_))));
        assert_eq!(controller.state(), SessionState::Recording);
        assert_eq!(controller.byte_size(), 10);
        assert_eq!(controller.duration(), Duration::from_millis(500));
        assert_eq!(controller.describe_current().unwrap().id, "mic-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wins_over_pending_flush() {
        let (controller, backend) = engine(EngineConfig::default());
        controller.start().await.unwrap();
        backend.set_defer_flush(true);
        controller.begin_recording().unwrap();

        let recorder = backend.recorder().unwrap();
        recorder.emit(vec![0u8; 10]);
        recorder.hold_for_flush(vec![9u8; 4]);

        let stopping = tokio::spawn({
            let controller = controller.clone();
            async move { controller.stop().await }
        });
        settle_until(&controller, SessionState::Stopping).await;

        controller.cancel().unwrap();
        recorder.complete_flush();

        let result = stopping.await.unwrap();
        assert!(matches!(result, Err(CaptureError::Cancelled)));
        assert_eq!(controller.state(), SessionState::Cancelled);
        assert!(controller.artifact().is_none());
        assert_eq!(controller.byte_size(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timeout_finalizes_partial_recording() {
        let mut config = EngineConfig::default();
        config.flush_timeout_ms = 100;
        let (controller, backend) = engine(config);
        controller.start().await.unwrap();
        backend.set_defer_flush(true);
        controller.begin_recording().unwrap();

        backend.recorder().unwrap().emit(vec![0u8; 10]);
        let artifact = controller.stop().await.unwrap();

        assert_eq!(artifact.len(), 10);
        assert_eq!(controller.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_permission_denied_fails_session() {
        let (controller, backend) = engine(EngineConfig::default());
        backend.set_permission(DeviceKind::AudioInput, PermissionStatus::Denied);

        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        controller.on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = controller.start().await;

        assert!(matches!(result, Err(CaptureError::PermissionDenied(_))));
        assert_eq!(controller.state(), SessionState::Failed);
        let reported = controller.last_error().unwrap();
        assert_eq!(reported.kind, ErrorKind::Permission);
        assert_eq!(reported.recovery, RecoveryAction::RePrompt);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(backend.probe().streams_acquired(), 0);
    }

    #[tokio::test]
    async fn test_device_disconnect_fails_recording() {
        let (controller, backend, recorder) = recording(EngineConfig::default()).await;
        recorder.emit(vec![0u8; 10]);

        backend.disconnect("mic-1");

        assert_eq!(controller.state(), SessionState::Failed);
        assert_eq!(controller.last_error().unwrap().kind, ErrorKind::Device);
        assert!(controller.artifact().is_none());
        assert_eq!(controller.snapshot().chunk_count, 0);

        controller.start().await.unwrap();
        assert_eq!(controller.state(), SessionState::Capturing);
        assert!(controller.last_error().is_none());
    }

    #[tokio::test]
    async fn test_recorder_fault_fails_session() {
        let (controller, _backend, recorder) = recording(EngineConfig::default()).await;

        recorder.fail(PlatformError::new(PlatformErrorCode::EncoderFault, "encoder crashed"));

        assert_eq!(controller.state(), SessionState::Failed);
        let reported = controller.last_error().unwrap();
        assert_eq!(reported.kind, ErrorKind::Recording);
        assert!(reported.detail.unwrap().contains("encoder crashed"));
    }

    #[tokio::test]
    async fn test_unavailable_format_falls_back() {
        let config = EngineConfig::default().with_mime_type("audio/mp4");
        let (controller, _backend) = engine(config);
        let mut rx = controller.subscribe();

        controller.start().await.unwrap();
        controller.begin_recording().unwrap();

        let fallback = drain(&mut rx).into_iter().find_map(|e| match e {
            EngineEvent::FormatFallback { requested, chosen } => Some((requested, chosen)),
            _ => None,
        });
        assert_eq!(
            fallback,
            Some(("audio/mp4".to_string(), "audio/webm;codecs=opus".to_string()))
        );
        assert_eq!(controller.state(), SessionState::Recording);
        assert!(controller.last_error().is_none());
    }

    #[tokio::test]
    async fn test_no_encoding_fails_session() {
        let (controller, backend) = engine(EngineConfig::default());
        backend.set_mime_types(DeviceKind::AudioInput, Vec::new());
        controller.start().await.unwrap();

        let result = controller.begin_recording();

        assert!(matches!(result, Err(CaptureError::UnsupportedFormat(_))));
        assert_eq!(controller.state(), SessionState::Failed);
        assert_eq!(backend.probe().tracks_stopped(), 1);
    }

    #[tokio::test]
    async fn test_max_bytes_fails_session() {
        let config = EngineConfig::default().with_max_bytes(25);
        let (controller, _backend, recorder) = recording(config).await;

        recorder.emit(vec![0u8; 10]);
        recorder.emit(vec![0u8; 10]);
        assert_eq!(controller.state(), SessionState::Recording);

        recorder.emit(vec![0u8; 10]);
        assert_eq!(controller.state(), SessionState::Failed);
        assert!(controller
            .last_error()
            .unwrap()
            .message
            .contains("maximum size"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_runs_while_capturing_and_stops_on_cancel() {
        let (controller, backend) = engine(EngineConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        controller.on_sample(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(210)).await;

        let history = controller.history();
        assert!(history.len() >= 3, "only {} samples", history.len());
        assert_eq!(seen.load(Ordering::SeqCst), history.len());
        assert!((controller.latest_sample().unwrap().level - 0.5).abs() < 1e-6);

        controller.cancel().unwrap();
        let probe = backend.probe();
        let taken = probe.snapshots_taken();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(probe.snapshots_taken(), taken);
        assert_eq!(probe.analysers_closed(), 1);
    }

    #[tokio::test]
    async fn test_switch_while_paused_keeps_recording() {
        let (controller, backend, recorder) = recording(EngineConfig::default()).await;
        let mut rx = controller.subscribe();

        recorder.emit(vec![1u8; 10]);
        controller.pause().unwrap();
        recorder.hold_for_flush(vec![2u8; 3]);

        controller.switch_device("mic-2").await.unwrap();

        assert_eq!(controller.state(), SessionState::Paused);
        assert_eq!(controller.describe_current().unwrap().id, "mic-2");
        assert_eq!(controller.byte_size(), 13);
        assert_eq!(recorder.phase(), RecorderPhase::Stopped);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, EngineEvent::DeviceChanged { device, .. } if device.id == "mic-2")));

        let replacement = backend.recorder().unwrap();
        assert_eq!(replacement.phase(), RecorderPhase::Paused);

        controller.resume().unwrap();
        replacement.emit(vec![3u8; 5]);
        recorder.emit(vec![4u8; 100]);

        let artifact = controller.stop().await.unwrap();
        assert_eq!(artifact.len(), 18);

        let probe = backend.probe();
        assert_eq!(probe.recorders_attached(), 2);
        assert_eq!(probe.analysers_opened(), 2);
        assert_eq!(probe.tracks_stopped(), 2);
    }

    #[tokio::test]
    async fn test_switch_between_sessions_picks_next_device() {
        let (controller, _backend) = engine(EngineConfig::default());

        controller.switch_device("mic-2").await.unwrap();
        controller.start().await.unwrap();
        assert_eq!(controller.describe_current().unwrap().id, "mic-2");

        controller.cancel().unwrap();
        let missing = controller.switch_device("nope").await;
        assert!(matches!(missing, Err(CaptureError::DeviceNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_permission_prompt() {
        let (controller, backend) = engine(EngineConfig::default());
        backend.set_access_delay(Some(Duration::from_secs(1)));

        let starting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start().await }
        });
        settle_until(&controller, SessionState::AcquiringPermission).await;

        controller.cancel().unwrap();
        let result = starting.await.unwrap();

        assert!(matches!(result, Err(CaptureError::Cancelled)));
        assert_eq!(controller.state(), SessionState::Cancelled);
        let probe = backend.probe();
        assert_eq!(probe.streams_acquired(), 1);
        assert_eq!(probe.tracks_stopped(), 1);
    }

    #[tokio::test]
    async fn test_clear_revokes_artifact() {
        let (controller, _backend, recorder) = recording(EngineConfig::default()).await;
        recorder.emit(vec![0u8; 8]);
        let artifact = controller.stop().await.unwrap();
        assert!(controller.store().is_live(artifact.handle()));

        controller.clear().unwrap();

        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.artifact().is_none());
        assert!(!controller.store().is_live(artifact.handle()));
        assert!(controller.clear().is_err());
    }

    #[tokio::test]
    async fn test_new_session_revokes_previous_artifact() {
        let (controller, _backend, recorder) = recording(EngineConfig::default()).await;
        recorder.emit(vec![0u8; 8]);
        let first = controller.stop().await.unwrap();

        controller.start().await.unwrap();

        assert!(!controller.store().is_live(first.handle()));
        assert_eq!(controller.byte_size(), 0);
    }

    #[tokio::test]
    async fn test_download_writes_artifact() {
        let (controller, _backend, recorder) = recording(EngineConfig::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("take.webm");

        assert!(matches!(
            controller.download(&target).await,
            Err(CaptureError::InvalidTransition {
                command: Command::Download,
                ..
            })
        ));

        recorder.emit(vec![7u8; 12]);
        controller.stop().await.unwrap();

        let path = controller.download(&target).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![7u8; 12]);
    }

    #[tokio::test]
    async fn test_dispose_releases_live_session() {
        let (controller, backend, recorder) = recording(EngineConfig::default()).await;
        recorder.emit(vec![0u8; 8]);

        let report = controller.dispose();

        assert!(report.stream_released);
        assert!(report.recorder_detached);
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(backend.probe().tracks_stopped(), 1);
        assert!(controller.dispose().is_noop());
    }

    #[tokio::test]
    async fn test_bound_device_is_reported() {
        let (controller, _backend) = engine(EngineConfig::default());
        controller.start().await.unwrap();

        let devices = controller.list_devices(DeviceKind::AudioInput).await.unwrap();
        let mic = devices.iter().find(|d| d.id == "mic-1").unwrap();

        assert!(mic.bound);
        assert_eq!(mic.label, "Built-in Microphone");
        assert_eq!(
            controller.permission_status(DeviceKind::AudioInput).await,
            PermissionStatus::Granted
        );
    }

    #[tokio::test]
    async fn test_device_is_unbound_after_session_ends() {
        let (controller, _backend, recorder) = recording(EngineConfig::default()).await;
        assert!(controller.describe_current().unwrap().bound);

        recorder.emit(vec![0u8; 4]);
        controller.stop().await.unwrap();

        let device = controller.describe_current().unwrap();
        assert_eq!(device.id, "mic-1");
        assert!(!device.bound);

        let devices = controller.list_devices(DeviceKind::AudioInput).await.unwrap();
        assert!(devices.iter().all(|d| !d.bound));

        controller.start().await.unwrap();
        controller.cancel().unwrap();
        assert!(!controller.describe_current().unwrap().bound);
    }

    #[tokio::test]
    async fn test_engines_on_one_adapter_share_device_bindings() {
        let backend = Arc::new(VirtualBackend::with_microphone());
        let first = RecordingController::new(backend.clone(), EngineConfig::default());
        let second = RecordingController::new(backend.clone(), EngineConfig::default());

        first.start().await.unwrap();
        first.begin_recording().unwrap();

        let result = second.start().await;
        assert!(matches!(result, Err(CaptureError::DeviceBusy(_))));
        assert_ne!(second.state(), SessionState::Capturing);
        assert_eq!(first.state(), SessionState::Recording);
        assert_eq!(
            backend.bindings().holder("mic-1"),
            first.snapshot().id
        );

        first.cancel().unwrap();
        assert!(!backend.bindings().is_bound("mic-1"));
        second.clear().unwrap();
        second.start().await.unwrap();
        assert_eq!(second.state(), SessionState::Capturing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_matches_recorded_time_for_any_pause_pattern() {
        // (ms recording, ms paused) per step; the last step is followed by stop
        let patterns: Vec<Vec<(u64, u64)>> = vec![
            vec![(0, 300), (500, 0)],
            vec![(200, 0), (0, 0), (300, 100)],
            vec![(100, 100), (100, 100), (100, 100), (100, 100)],
            vec![(0, 0), (0, 0), (750, 2000)],
            vec![(1000, 0)],
        ];

        for pattern in patterns {
            let (controller, _backend, recorder) = recording(EngineConfig::default()).await;
            recorder.emit(vec![1u8; 8]);

            let mut expected_ms = 0u64;
            let mut last_ms = 0.0;
            for (index, &(recording_ms, paused_ms)) in pattern.iter().enumerate() {
                advance(Duration::from_millis(recording_ms)).await;
                expected_ms += recording_ms;
                if index + 1 == pattern.len() {
                    break;
                }

                controller.pause().unwrap();
                advance(Duration::from_millis(paused_ms)).await;
                let paused_at = controller.snapshot().duration_ms;
                assert!((paused_at - expected_ms as f64).abs() < 1e-3, "{:?}", pattern);
                assert!(paused_at >= last_ms, "{:?}", pattern);
                last_ms = paused_at;
                controller.resume().unwrap();
            }

            let artifact = controller.stop().await.unwrap();
            assert!(
                (artifact.duration_ms() - expected_ms as f64).abs() < 1e-3,
                "{:?}: {} != {}",
                pattern,
                artifact.duration_ms(),
                expected_ms
            );
            assert!(artifact.duration_ms() >= last_ms);
            let reported_ms = controller.duration().as_secs_f64() * 1000.0;
            assert!((reported_ms - expected_ms as f64).abs() < 1e-3, "{:?}", pattern);

            // Frozen once stopped
            advance(Duration::from_millis(500)).await;
            assert_eq!(controller.snapshot().duration_ms, artifact.duration_ms());
        }
    }
}
