//! Engine events and observers
//!
//! Everything the engine makes observable goes through [`Publisher`]:
//! broadcast events for subscribers plus the sample, error and artifact
//! callbacks. Publishing always happens after session data is unlocked.

use super::artifact::{Artifact, ArtifactInfo};
use super::reporter::ReportedError;
use super::sampling::AnalyticsSample;
use super::state::SessionState;
use crate::capture::traits::DeviceDescriptor;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted during a capture session
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Session moved between states
    StateChanged {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
    /// Recording progress update
    Progress {
        session_id: String,
        duration_ms: f64,
        byte_size: u64,
    },
    /// The live stream was rebound to another device
    DeviceChanged {
        session_id: String,
        device: DeviceDescriptor,
    },
    /// A chunk was accepted
    ChunkAppended {
        session_id: String,
        len: usize,
        byte_size: u64,
    },
    /// The requested encoding was unavailable
    FormatFallback { requested: String, chosen: String },
    /// A classified error was reported
    Error(ReportedError),
    /// A recording finished
    ArtifactReady(ArtifactInfo),
}

type SampleCallback = Arc<dyn Fn(&AnalyticsSample) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ReportedError) + Send + Sync>;
type ArtifactCallback = Arc<dyn Fn(&Artifact) + Send + Sync>;

/// Deferred publication, collected while session data is locked
#[derive(Debug, Clone)]
pub enum Notification {
    Event(EngineEvent),
    Sample(AnalyticsSample),
    Error(ReportedError),
    Artifact(Artifact),
}

/// Event fan-out
pub struct Publisher {
    events: broadcast::Sender<EngineEvent>,
    samples: RwLock<Vec<SampleCallback>>,
    errors: RwLock<Vec<ErrorCallback>>,
    artifacts: RwLock<Vec<ArtifactCallback>>,
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            samples: RwLock::new(Vec::new()),
            errors: RwLock::new(Vec::new()),
            artifacts: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn on_sample<F>(&self, callback: F)
    where
        F: Fn(&AnalyticsSample) + Send + Sync + 'static,
    {
        self.samples.write().push(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&ReportedError) + Send + Sync + 'static,
    {
        self.errors.write().push(Arc::new(callback));
    }

    pub fn on_artifact_ready<F>(&self, callback: F)
    where
        F: Fn(&Artifact) + Send + Sync + 'static,
    {
        self.artifacts.write().push(Arc::new(callback));
    }

    pub fn publish(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            match notification {
                Notification::Event(event) => self.send(event),
                Notification::Sample(sample) => {
                    let callbacks = self.samples.read().clone();
                    for callback in callbacks {
                        callback(&sample);
                    }
                }
                Notification::Error(error) => {
                    let callbacks = self.errors.read().clone();
                    for callback in callbacks {
                        callback(&error);
                    }
                    self.send(EngineEvent::Error(error));
                }
                Notification::Artifact(artifact) => {
                    let callbacks = self.artifacts.read().clone();
                    for callback in callbacks {
                        callback(&artifact);
                    }
                    self.send(EngineEvent::ArtifactReady(artifact.info()));
                }
            }
        }
    }

    fn send(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
