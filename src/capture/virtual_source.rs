//! In-memory capture adapter
//!
//! A scripted [`CaptureBackend`] with no platform dependencies. It serves
//! audio inputs and display surfaces, lets callers push recorder chunks,
//! end tracks and inject platform failures, and counts every resource it
//! hands out so leaks are observable.

use super::acquisition::BindingTable;
use super::traits::{
    Analyser, CaptureBackend, Constraints, DeviceKind, EventSink, MediaStream, NativeEvent,
    PermissionStatus, RawDevice, RecorderHandle, RecorderOptions, SignalSnapshot,
};
use crate::utils::error::{PlatformError, PlatformErrorCode};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A device the virtual adapter exposes
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    pub kind: DeviceKind,
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

impl VirtualDevice {
    pub fn new(kind: DeviceKind, id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            label: label.into(),
            is_default: false,
        }
    }

    pub fn default_device(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Resource counters
#[derive(Debug, Default)]
pub struct VirtualProbe {
    streams_acquired: AtomicUsize,
    tracks_stopped: AtomicUsize,
    recorders_attached: AtomicUsize,
    analysers_opened: AtomicUsize,
    analysers_closed: AtomicUsize,
    snapshots_taken: AtomicUsize,
}

impl VirtualProbe {
    pub fn streams_acquired(&self) -> usize {
        self.streams_acquired.load(Ordering::SeqCst)
    }

    /// Streams whose tracks were stopped while still live
    pub fn tracks_stopped(&self) -> usize {
        self.tracks_stopped.load(Ordering::SeqCst)
    }

    pub fn recorders_attached(&self) -> usize {
        self.recorders_attached.load(Ordering::SeqCst)
    }

    pub fn analysers_opened(&self) -> usize {
        self.analysers_opened.load(Ordering::SeqCst)
    }

    pub fn analysers_closed(&self) -> usize {
        self.analysers_closed.load(Ordering::SeqCst)
    }

    pub fn snapshots_taken(&self) -> usize {
        self.snapshots_taken.load(Ordering::SeqCst)
    }
}

struct BackendState {
    devices: Vec<VirtualDevice>,
    unsupported: HashSet<DeviceKind>,
    permissions: HashMap<DeviceKind, PermissionStatus>,
    mime_types: HashMap<DeviceKind, Vec<String>>,
    next_access_error: Option<PlatformError>,
    enumeration_error: Option<PlatformError>,
    access_delay: Option<Duration>,
    defer_flush: bool,
    streams: Vec<Arc<VirtualStream>>,
    recorder: Option<VirtualRecorder>,
}

/// Scripted capture adapter
pub struct VirtualBackend {
    state: Mutex<BackendState>,
    level: Arc<Mutex<f32>>,
    probe: Arc<VirtualProbe>,
    bindings: BindingTable,
}

impl VirtualBackend {
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        let mut mime_types = HashMap::new();
        mime_types.insert(
            DeviceKind::AudioInput,
            vec![
                "audio/webm;codecs=opus".to_string(),
                "audio/webm".to_string(),
                "audio/ogg".to_string(),
            ],
        );
        mime_types.insert(
            DeviceKind::DisplaySurface,
            vec!["video/webm;codecs=vp9".to_string(), "video/webm".to_string()],
        );

        Self {
            state: Mutex::new(BackendState {
                devices,
                unsupported: HashSet::new(),
                permissions: HashMap::new(),
                mime_types,
                next_access_error: None,
                enumeration_error: None,
                access_delay: None,
                defer_flush: false,
                streams: Vec::new(),
                recorder: None,
            }),
            level: Arc::new(Mutex::new(0.5)),
            probe: Arc::new(VirtualProbe::default()),
            bindings: BindingTable::new(),
        }
    }

    /// One default microphone, `mic-1`
    pub fn with_microphone() -> Self {
        Self::new(vec![VirtualDevice::new(
            DeviceKind::AudioInput,
            "mic-1",
            "Built-in Microphone",
        )
        .default_device()])
    }

    /// Two microphones and one display
    pub fn with_standard_devices() -> Self {
        Self::new(vec![
            VirtualDevice::new(DeviceKind::AudioInput, "mic-1", "Built-in Microphone")
                .default_device(),
            VirtualDevice::new(DeviceKind::AudioInput, "mic-2", "USB Microphone"),
            VirtualDevice::new(DeviceKind::DisplaySurface, "display-1", "Main Display")
                .default_device(),
        ])
    }

    pub fn probe(&self) -> Arc<VirtualProbe> {
        self.probe.clone()
    }

    pub fn add_device(&self, device: VirtualDevice) {
        self.state.lock().devices.push(device);
    }

    pub fn remove_device(&self, id: &str) {
        self.state.lock().devices.retain(|d| d.id != id);
    }

    /// Fail the next `request_access` with `error`
    pub fn fail_next_access(&self, error: PlatformError) {
        self.state.lock().next_access_error = Some(error);
    }

    /// Fail every enumeration with `error` (`None` clears it)
    pub fn fail_enumeration(&self, error: Option<PlatformError>) {
        self.state.lock().enumeration_error = error;
    }

    pub fn set_supported(&self, kind: DeviceKind, supported: bool) {
        let mut state = self.state.lock();
        if supported {
            state.unsupported.remove(&kind);
        } else {
            state.unsupported.insert(kind);
        }
    }

    pub fn set_permission(&self, kind: DeviceKind, status: PermissionStatus) {
        self.state.lock().permissions.insert(kind, status);
    }

    pub fn set_mime_types(&self, kind: DeviceKind, mime_types: Vec<String>) {
        self.state.lock().mime_types.insert(kind, mime_types);
    }

    /// Delay stream negotiation, as a pending permission prompt would
    pub fn set_access_delay(&self, delay: Option<Duration>) {
        self.state.lock().access_delay = delay;
    }

    /// Hold the recorder's final flush until [`VirtualRecorder::complete_flush`]
    pub fn set_defer_flush(&self, defer: bool) {
        self.state.lock().defer_flush = defer;
    }

    /// Level the analyser reports, 0.0..=1.0
    pub fn set_level(&self, level: f32) {
        *self.level.lock() = level.clamp(0.0, 1.0);
    }

    /// Most recently attached recorder
    pub fn recorder(&self) -> Option<VirtualRecorder> {
        self.state.lock().recorder.clone()
    }

    /// Most recently acquired stream for `device_id`
    pub fn stream(&self, device_id: &str) -> Option<Arc<VirtualStream>> {
        self.state
            .lock()
            .streams
            .iter()
            .rev()
            .find(|s| s.device_id == device_id)
            .cloned()
    }

    /// Simulate the device being unplugged
    pub fn disconnect(&self, device_id: &str) {
        if let Some(stream) = self.stream(device_id) {
            stream.end_track();
        }
    }

    fn permission_for(&self, kind: DeviceKind) -> PermissionStatus {
        self.state
            .lock()
            .permissions
            .get(&kind)
            .copied()
            .unwrap_or(PermissionStatus::Prompt)
    }
}

#[async_trait]
impl CaptureBackend for VirtualBackend {
    fn name(&self) -> &str {
        "virtual"
    }

    fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    async fn enumerate(&self, kind: DeviceKind) -> Result<Vec<RawDevice>, PlatformError> {
        let granted = self.permission_for(kind) == PermissionStatus::Granted;
        let state = self.state.lock();

        if let Some(error) = &state.enumeration_error {
            return Err(error.clone());
        }

        // Labels are withheld until access has been granted once
        Ok(state
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| RawDevice {
                id: d.id.clone(),
                label: if granted { d.label.clone() } else { String::new() },
                is_default: d.is_default,
            })
            .collect())
    }

    async fn permission(&self, kind: DeviceKind) -> PermissionStatus {
        self.permission_for(kind)
    }

    async fn request_access(
        &self,
        constraints: &Constraints,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn MediaStream>, PlatformError> {
        let delay = self.state.lock().access_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.state.lock().next_access_error.take() {
            return Err(error);
        }

        if self.state.lock().unsupported.contains(&constraints.kind) {
            return Err(PlatformError::new(
                PlatformErrorCode::NotSupported,
                format!("{} capture is not available", constraints.kind),
            ));
        }

        if self.permission_for(constraints.kind) == PermissionStatus::Denied {
            return Err(PlatformError::new(
                PlatformErrorCode::AccessDenied,
                "permission denied by user",
            ));
        }

        let mut state = self.state.lock();
        let device = {
            let mut candidates = state.devices.iter().filter(|d| d.kind == constraints.kind);
            match &constraints.device_id {
                Some(id) => candidates.find(|d| &d.id == id).cloned(),
                None => {
                    let all: Vec<&VirtualDevice> = candidates.collect();
                    all.iter()
                        .find(|d| d.is_default)
                        .or_else(|| all.first())
                        .map(|d| (*d).clone())
                }
            }
        };

        let device = device.ok_or_else(|| {
            PlatformError::new(
                PlatformErrorCode::NotFound,
                format!(
                    "no {} device matches {:?}",
                    constraints.kind, constraints.device_id
                ),
            )
        })?;

        state.permissions.insert(constraints.kind, PermissionStatus::Granted);

        let stream = Arc::new(VirtualStream {
            id: Uuid::new_v4().to_string(),
            device_id: device.id.clone(),
            label: device.label.clone(),
            kind: device.kind,
            live: AtomicBool::new(true),
            events,
            probe: self.probe.clone(),
        });
        state.streams.push(stream.clone());
        self.probe.streams_acquired.fetch_add(1, Ordering::SeqCst);

        Ok(stream)
    }

    fn supported_mime_types(&self, kind: DeviceKind) -> Vec<String> {
        self.state
            .lock()
            .mime_types
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    fn attach_recorder(
        &self,
        stream: Arc<dyn MediaStream>,
        options: &RecorderOptions,
        events: Arc<dyn EventSink>,
    ) -> Result<Box<dyn RecorderHandle>, PlatformError> {
        if !stream.is_live() {
            return Err(PlatformError::new(
                PlatformErrorCode::Ended,
                "cannot record an ended stream",
            ));
        }

        let supported = self.supported_mime_types(stream.kind());
        if !supported.iter().any(|m| m == &options.mime_type) {
            return Err(PlatformError::new(
                PlatformErrorCode::FormatUnavailable,
                format!("{} is not supported", options.mime_type),
            ));
        }

        let recorder = VirtualRecorder {
            core: Arc::new(RecorderCore {
                mime_type: options.mime_type.clone(),
                events,
                phase: Mutex::new(RecorderPhase::Inactive),
                pending: Mutex::new(Vec::new()),
                defer_flush: self.state.lock().defer_flush,
            }),
        };

        self.state.lock().recorder = Some(recorder.clone());
        self.probe.recorders_attached.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(VirtualRecorderHandle { core: recorder.core }))
    }

    fn open_analyser(&self, stream: Arc<dyn MediaStream>) -> Result<Box<dyn Analyser>, PlatformError> {
        self.probe.analysers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualAnalyser {
            stream,
            level: self.level.clone(),
            probe: self.probe.clone(),
            closed: false,
        }))
    }
}

/// Stream handed out by [`VirtualBackend`]
pub struct VirtualStream {
    id: String,
    device_id: String,
    label: String,
    kind: DeviceKind,
    live: AtomicBool,
    events: Arc<dyn EventSink>,
    probe: Arc<VirtualProbe>,
}

impl VirtualStream {
    /// End the track from the platform side
    pub fn end_track(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.events.emit(NativeEvent::TrackEnded);
        }
    }
}

impl MediaStream for VirtualStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn stop_tracks(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.probe.tracks_stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Recorder lifecycle as seen by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderPhase {
    Inactive,
    Recording,
    Paused,
    Flushing,
    Stopped,
}

struct RecorderCore {
    mime_type: String,
    events: Arc<dyn EventSink>,
    phase: Mutex<RecorderPhase>,
    pending: Mutex<Vec<u8>>,
    defer_flush: bool,
}

impl RecorderCore {
    fn flush(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            self.events.emit(NativeEvent::Data(pending));
        }
        *self.phase.lock() = RecorderPhase::Stopped;
        self.events.emit(NativeEvent::RecorderStopped);
    }
}

/// Control side of a virtual recorder, for driving native events
#[derive(Clone)]
pub struct VirtualRecorder {
    core: Arc<RecorderCore>,
}

impl VirtualRecorder {
    pub fn phase(&self) -> RecorderPhase {
        *self.core.phase.lock()
    }

    pub fn mime_type(&self) -> &str {
        &self.core.mime_type
    }

    /// Emit a data event, as a timeslice elapsing would
    pub fn emit(&self, chunk: impl Into<Vec<u8>>) {
        self.core.events.emit(NativeEvent::Data(chunk.into()));
    }

    /// Buffer bytes that only arrive with the final flush
    pub fn hold_for_flush(&self, bytes: impl Into<Vec<u8>>) {
        self.core.pending.lock().extend(bytes.into());
    }

    /// Finish a deferred flush
    pub fn complete_flush(&self) {
        if *self.core.phase.lock() == RecorderPhase::Flushing {
            self.core.flush();
        }
    }

    /// Raise a recorder fault
    pub fn fail(&self, error: PlatformError) {
        self.core.events.emit(NativeEvent::RecorderError(error));
    }
}

struct VirtualRecorderHandle {
    core: Arc<RecorderCore>,
}

impl VirtualRecorderHandle {
    fn expect_phase(&self, expected: RecorderPhase, next: RecorderPhase) -> Result<(), PlatformError> {
        let mut phase = self.core.phase.lock();
        if *phase != expected {
            return Err(PlatformError::new(
                PlatformErrorCode::EncoderFault,
                format!("recorder is {:?}, expected {:?}", *phase, expected),
            ));
        }
        *phase = next;
        Ok(())
    }
}

impl RecorderHandle for VirtualRecorderHandle {
    fn mime_type(&self) -> &str {
        &self.core.mime_type
    }

    fn start(&mut self) -> Result<(), PlatformError> {
        self.expect_phase(RecorderPhase::Inactive, RecorderPhase::Recording)
    }

    fn pause(&mut self) -> Result<(), PlatformError> {
        self.expect_phase(RecorderPhase::Recording, RecorderPhase::Paused)
    }

    fn resume(&mut self) -> Result<(), PlatformError> {
        self.expect_phase(RecorderPhase::Paused, RecorderPhase::Recording)
    }

    fn stop(&mut self) -> Result<(), PlatformError> {
        {
            let mut phase = self.core.phase.lock();
            match *phase {
                RecorderPhase::Flushing | RecorderPhase::Stopped => return Ok(()),
                _ => *phase = RecorderPhase::Flushing,
            }
        }

        if !self.core.defer_flush {
            self.core.flush();
        }
        Ok(())
    }
}

struct VirtualAnalyser {
    stream: Arc<dyn MediaStream>,
    level: Arc<Mutex<f32>>,
    probe: Arc<VirtualProbe>,
    closed: bool,
}

impl Analyser for VirtualAnalyser {
    fn snapshot(&mut self) -> Option<SignalSnapshot> {
        if self.closed || !self.stream.is_live() {
            return None;
        }
        self.probe.snapshots_taken.fetch_add(1, Ordering::SeqCst);

        let level = *self.level.lock();
        let time_domain = (0..32)
            .map(|i| if i % 2 == 0 { level } else { -level })
            .collect();

        Some(SignalSnapshot {
            time_domain,
            frequency: vec![level; 16],
        })
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        if !self.closed {
            self.closed = true;
            self.probe.analysers_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
