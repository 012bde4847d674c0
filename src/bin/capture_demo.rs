//! Drives a scripted microphone session end to end and saves the result.
//!
//! Usage: capture-demo [OUTPUT_PATH] [CONFIG_JSON]

use anyhow::{Context, Result};
use open_capture::capture::{DeviceKind, VirtualBackend};
use open_capture::recorder::{EngineConfig, EngineEvent, RecordingController};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    open_capture::init_tracing();

    let mut args = std::env::args().skip(1);
    let output = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("capture-demo.webm"));

    let config = match args.next() {
        Some(path) => EngineConfig::from_json_file(Path::new(&path))
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => EngineConfig::default(),
    };

    let backend = Arc::new(VirtualBackend::with_standard_devices());
    let probe = backend.probe();
    let controller = RecordingController::new(backend.clone(), config);

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::StateChanged { from, to, .. } => println!("state: {} -> {}", from, to),
                EngineEvent::Progress {
                    duration_ms,
                    byte_size,
                    ..
                } => println!("progress: {:.0}ms, {} bytes", duration_ms, byte_size),
                EngineEvent::Error(error) => println!("error ({}): {}", error.kind, error.message),
                _ => {}
            }
        }
    });

    for device in controller.list_devices(DeviceKind::AudioInput).await? {
        println!("device: {} ({})", device.label, device.id);
    }

    controller.start().await?;
    controller.begin_recording()?;
    let recorder = backend
        .recorder()
        .context("Virtual adapter did not attach a recorder")?;

    for second in 0..3u8 {
        backend.set_level(0.2 + f32::from(second) * 0.2);
        recorder.emit(vec![second; 4096]);
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    controller.pause()?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    controller.resume()?;

    recorder.hold_for_flush(vec![0xff; 1024]);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let artifact = controller.stop().await?;
    let path = controller.download(&output).await?;

    println!(
        "saved {} bytes ({:.0}ms of {}) to {}",
        artifact.len(),
        artifact.duration_ms(),
        artifact.mime_type(),
        path.display()
    );
    if let Some(level) = controller.latest_sample().map(|s| s.level) {
        println!("last level: {:.2}", level);
    }

    controller.dispose();
    println!(
        "streams acquired: {}, tracks stopped: {}",
        probe.streams_acquired(),
        probe.tracks_stopped()
    );
    Ok(())
}
