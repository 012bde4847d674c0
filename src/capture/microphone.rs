//! Native microphone adapter using cpal
//!
//! Each acquired stream owns a capture thread that keeps the cpal input
//! stream alive (cpal streams are not `Send`). The recorder emits raw
//! little-endian f32 PCM every timeslice through a [`RecorderTap`]; the
//! analyser reads the most recent samples.

use super::acquisition::BindingTable;
use super::pcm::{i16_to_f32, run_emitter, RecorderTap, SampleWindow};
use super::traits::{
    Analyser, CaptureBackend, Constraints, DeviceKind, EventSink, MediaStream, NativeEvent,
    PermissionStatus, RawDevice, RecorderHandle, RecorderOptions, SignalSnapshot,
};
use crate::utils::error::{PlatformError, PlatformErrorCode};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Encoding produced by the microphone recorder
pub const PCM_MIME_TYPE: &str = "audio/pcm";

/// Samples kept for the analyser
const RECENT_SAMPLES: usize = 2048;

/// Samples per analyser snapshot
const SNAPSHOT_SAMPLES: usize = 256;

fn find_input_device(device_id: Option<&str>) -> Option<Device> {
    let host = cpal::default_host();
    match device_id {
        Some(id) => host
            .input_devices()
            .ok()?
            .find(|d| d.name().map(|name| name == id).unwrap_or(false)),
        None => host.default_input_device(),
    }
}

/// Microphone capture through the platform audio host
#[derive(Default)]
pub struct MicrophoneBackend {
    /// Open streams by stream id
    streams: Mutex<HashMap<String, Arc<MicShared>>>,
    bindings: BindingTable,
}

impl MicrophoneBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if any input device is present
    pub fn is_available() -> bool {
        cpal::default_host().default_input_device().is_some()
    }
}

#[async_trait]
impl CaptureBackend for MicrophoneBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    async fn enumerate(&self, kind: DeviceKind) -> Result<Vec<RawDevice>, PlatformError> {
        if kind != DeviceKind::AudioInput {
            return Ok(Vec::new());
        }

        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let devices = host
            .input_devices()
            .map_err(|e| PlatformError::new(PlatformErrorCode::Unknown, e.to_string()))?;

        Ok(devices
            .map(|device| {
                let name = device.name().unwrap_or_default();
                RawDevice {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    id: name.clone(),
                    label: name,
                }
            })
            .collect())
    }

    async fn permission(&self, kind: DeviceKind) -> PermissionStatus {
        // Host audio APIs prompt (or not) when the stream opens
        match kind {
            DeviceKind::AudioInput => PermissionStatus::Prompt,
            DeviceKind::DisplaySurface => PermissionStatus::Denied,
        }
    }

    async fn request_access(
        &self,
        constraints: &Constraints,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn MediaStream>, PlatformError> {
        if constraints.kind != DeviceKind::AudioInput {
            return Err(PlatformError::new(
                PlatformErrorCode::NotSupported,
                "the microphone adapter cannot capture displays",
            ));
        }

        let shared = Arc::new(MicShared {
            live: AtomicBool::new(true),
            recent: Mutex::new(SampleWindow::new(RECENT_SAMPLES)),
            tap: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_shared = shared.clone();
        let thread_events = events.clone();
        let device_id = constraints.device_id.clone();
        let sample_rate = constraints.sample_rate;

        std::thread::spawn(move || {
            run_capture(thread_shared, thread_events, device_id, sample_rate, ready_tx)
        });

        let (device_id, config) = ready_rx.await.map_err(|_| {
            PlatformError::new(PlatformErrorCode::Aborted, "capture thread exited early")
        })??;

        tracing::info!(
            "Microphone stream opened: {} ({}Hz, {}ch)",
            device_id,
            config.sample_rate.0,
            config.channels
        );

        let id = Uuid::new_v4().to_string();
        let mut streams = self.streams.lock();
        streams.retain(|_, s| s.live.load(Ordering::SeqCst));
        streams.insert(id.clone(), shared.clone());

        Ok(Arc::new(MicStream {
            id,
            label: device_id.clone(),
            device_id,
            shared,
        }))
    }

    fn supported_mime_types(&self, kind: DeviceKind) -> Vec<String> {
        match kind {
            DeviceKind::AudioInput => vec![PCM_MIME_TYPE.to_string()],
            DeviceKind::DisplaySurface => Vec::new(),
        }
    }

    fn attach_recorder(
        &self,
        stream: Arc<dyn MediaStream>,
        options: &RecorderOptions,
        events: Arc<dyn EventSink>,
    ) -> Result<Box<dyn RecorderHandle>, PlatformError> {
        if options.mime_type != PCM_MIME_TYPE {
            return Err(PlatformError::new(
                PlatformErrorCode::FormatUnavailable,
                format!("{} is not supported", options.mime_type),
            ));
        }

        let shared = self.live_shared(stream.as_ref())?;
        let tap = Arc::new(RecorderTap::new());
        if let Some(previous) = shared.tap.lock().replace(tap.clone()) {
            previous.stop();
        }

        Ok(Box::new(MicRecorder {
            tap,
            events,
            timeslice: Duration::from_millis(options.timeslice_ms.max(10)),
            started: false,
        }))
    }

    fn open_analyser(&self, stream: Arc<dyn MediaStream>) -> Result<Box<dyn Analyser>, PlatformError> {
        let shared = self.live_shared(stream.as_ref())?;
        Ok(Box::new(MicAnalyser {
            shared: Some(shared),
        }))
    }
}

impl MicrophoneBackend {
    /// Capture state behind a stream opened by this adapter
    fn live_shared(&self, stream: &dyn MediaStream) -> Result<Arc<MicShared>, PlatformError> {
        if !stream.is_live() {
            return Err(PlatformError::new(PlatformErrorCode::Ended, "stream has ended"));
        }
        self.streams.lock().get(stream.id()).cloned().ok_or_else(|| {
            PlatformError::new(
                PlatformErrorCode::NotSupported,
                "stream was not opened by the microphone adapter",
            )
        })
    }
}

/// State shared between a stream, its capture thread and its readers
struct MicShared {
    live: AtomicBool,
    recent: Mutex<SampleWindow>,
    tap: Mutex<Option<Arc<RecorderTap>>>,
}

impl MicShared {
    fn push_samples(&self, samples: &[f32]) {
        self.recent.lock().push(samples);
        if let Some(tap) = self.tap.lock().as_ref() {
            tap.push(samples);
        }
    }
}

type Ready = Result<(String, StreamConfig), PlatformError>;

/// Capture thread body: owns the cpal stream until the tracks stop
fn run_capture(
    shared: Arc<MicShared>,
    events: Arc<dyn EventSink>,
    device_id: Option<String>,
    sample_rate: Option<u32>,
    ready: oneshot::Sender<Ready>,
) {
    let Some(device) = find_input_device(device_id.as_deref()) else {
        let _ = ready.send(Err(PlatformError::new(
            PlatformErrorCode::NotFound,
            format!("no input device matches {:?}", device_id),
        )));
        return;
    };
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(PlatformError::new(
                PlatformErrorCode::NotReadable,
                format!("Failed to get audio config: {}", e),
            )));
            return;
        }
    };

    let format = supported.sample_format();
    let mut config = supported.config();
    if let Some(rate) = sample_rate {
        config.sample_rate = cpal::SampleRate(rate);
    }

    let error_events = events.clone();
    let error_shared = shared.clone();
    let on_error = move |err: cpal::StreamError| {
        tracing::error!("Microphone stream error: {}", err);
        if let cpal::StreamError::DeviceNotAvailable = err {
            if error_shared.live.swap(false, Ordering::SeqCst) {
                error_events.emit(NativeEvent::TrackEnded);
            }
        }
    };

    let data_shared = shared.clone();
    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| data_shared.push_samples(data),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                data_shared.push_samples(&i16_to_f32(data));
            },
            on_error,
            None,
        ),
        other => {
            let _ = ready.send(Err(PlatformError::new(
                PlatformErrorCode::Overconstrained,
                format!("unsupported sample format {:?}", other),
            )));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let code = match e {
                cpal::BuildStreamError::DeviceNotAvailable => PlatformErrorCode::NotFound,
                cpal::BuildStreamError::StreamConfigNotSupported => PlatformErrorCode::Overconstrained,
                _ => PlatformErrorCode::NotReadable,
            };
            let _ = ready.send(Err(PlatformError::new(code, e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(PlatformError::new(
            PlatformErrorCode::AccessDenied,
            format!("Failed to start audio stream: {}", e),
        )));
        return;
    }

    if ready.send(Ok((name.clone(), config))).is_err() {
        return;
    }

    // Keep the stream alive until the tracks stop
    while shared.live.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
    tracing::info!("Microphone stream stopped: {}", name);
}

struct MicStream {
    id: String,
    device_id: String,
    label: String,
    shared: Arc<MicShared>,
}

impl MediaStream for MicStream {
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
        DeviceKind::AudioInput
    }

    fn stop_tracks(&self) {
        self.shared.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::SeqCst)
    }
}

/// Emits buffered PCM every timeslice from its own thread
struct MicRecorder {
    tap: Arc<RecorderTap>,
    events: Arc<dyn EventSink>,
    timeslice: Duration,
    started: bool,
}

impl RecorderHandle for MicRecorder {
    fn mime_type(&self) -> &str {
        PCM_MIME_TYPE
    }

    fn start(&mut self) -> Result<(), PlatformError> {
        if self.started {
            return Err(PlatformError::new(
                PlatformErrorCode::EncoderFault,
                "recorder already started",
            ));
        }
        self.started = true;
        self.tap.set_recording(true);

        let tap = self.tap.clone();
        let events = self.events.clone();
        let timeslice = self.timeslice;

        std::thread::spawn(move || run_emitter(&tap, timeslice, events.as_ref()));
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlatformError> {
        self.tap.set_recording(false);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlatformError> {
        self.tap.set_recording(true);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlatformError> {
        self.tap.stop();
        Ok(())
    }
}

impl Drop for MicRecorder {
    fn drop(&mut self) {
        self.tap.stop();
    }
}

/// Amplitude analyser over the most recent samples
struct MicAnalyser {
    shared: Option<Arc<MicShared>>,
}

impl Analyser for MicAnalyser {
    fn snapshot(&mut self) -> Option<SignalSnapshot> {
        let shared = self.shared.as_ref()?;
        if !shared.live.load(Ordering::SeqCst) {
            return None;
        }

        let recent = shared.recent.lock();
        if recent.is_empty() {
            return None;
        }
        Some(SignalSnapshot {
            time_domain: recent.latest(SNAPSHOT_SAMPLES),
            frequency: Vec::new(),
        })
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        self.shared = None;
        Ok(())
    }
}
