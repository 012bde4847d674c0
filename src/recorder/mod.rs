//! Recording engine
//!
//! This module implements the capture session lifecycle:
//! - RecordingController, the single-session state machine
//! - ChunkBuffer and the artifact store for encoded output
//! - Sampling loop and rolling analytics history
//! - ResourceJanitor for deterministic teardown

pub mod artifact;
pub mod chunks;
pub mod config;
pub mod controller;
pub mod events;
pub mod janitor;
pub mod reporter;
pub mod sampling;
pub mod session;
pub mod state;
pub mod timers;

pub use artifact::{Artifact, ArtifactHandle, ArtifactInfo, ArtifactStore, MemoryArtifactStore};
pub use chunks::ChunkBuffer;
pub use config::EngineConfig;
pub use controller::RecordingController;
pub use events::EngineEvent;
pub use janitor::{CleanupReport, ResourceJanitor};
pub use reporter::{ErrorReporter, ReportedError};
pub use sampling::{AnalyticsSample, SampleHistory};
pub use session::CaptureSession;
pub use state::{Command, RecordingSegment, SessionSnapshot, SessionState};
