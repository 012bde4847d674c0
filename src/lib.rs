//! Open Capture - browser-style media capture sessions, natively.
//!
//! Acquires a microphone or display stream, samples it for live levels,
//! records it into an ordered chunk list and hands back a single artifact.
//! One session runs at a time; every resource it takes is released on
//! stop, cancel, failure or disposal.

pub mod capture;
pub mod recorder;
pub mod utils;

pub use capture::{CaptureBackend, Constraints, DeviceDescriptor, DeviceKind, VirtualBackend};
pub use recorder::{
    Artifact, EngineConfig, EngineEvent, RecordingController, SessionSnapshot, SessionState,
};
pub use utils::error::{CaptureError, CaptureResult, ErrorKind, RecoveryAction};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber
///
/// `RUST_LOG` overrides the default `open_capture=debug` filter. Does
/// nothing if a subscriber is already installed.
pub fn init_tracing() {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "open_capture=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if installed.is_ok() {
        tracing::info!("Starting Open Capture v{}", env!("CARGO_PKG_VERSION"));
    }
}
