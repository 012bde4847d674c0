//! Stream acquisition
//!
//! Negotiates live streams from a source adapter and keeps track of which
//! devices are bound, so a source is never handed to two sessions at once.

use super::traits::{CaptureBackend, Constraints, EventSink, MediaStream};
use crate::recorder::reporter::ErrorReporter;
use crate::utils::error::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Device id → id of the session holding it
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `device_id` to `session_id`. Fails if another session holds it.
    pub fn try_bind(&self, device_id: &str, session_id: &str) -> bool {
        let mut bindings = self.inner.lock();
        match bindings.get(device_id) {
            Some(holder) if holder != session_id => false,
            _ => {
                bindings.insert(device_id.to_string(), session_id.to_string());
                true
            }
        }
    }

    pub fn unbind(&self, device_id: &str) {
        self.inner.lock().remove(device_id);
    }

    pub fn is_bound(&self, device_id: &str) -> bool {
        self.inner.lock().contains_key(device_id)
    }

    /// Session currently holding `device_id`
    pub fn holder(&self, device_id: &str) -> Option<String> {
        self.inner.lock().get(device_id).cloned()
    }
}

/// A stream exclusively owned by one session
///
/// Not clonable. Readers (recorder, analyser) get the shared handle through
/// [`BoundStream::shared`], but only [`StreamAcquisition::release`] stops it.
pub struct BoundStream {
    stream: Arc<dyn MediaStream>,
    session_id: String,
    released: AtomicBool,
}

impl BoundStream {
    pub fn id(&self) -> &str {
        self.stream.id()
    }

    pub fn device_id(&self) -> &str {
        self.stream.device_id()
    }

    pub fn label(&self) -> &str {
        self.stream.label()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Read handle for the recorder and analyser
    pub fn shared(&self) -> Arc<dyn MediaStream> {
        self.stream.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for BoundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundStream")
            .field("id", &self.stream.id())
            .field("device_id", &self.stream.device_id())
            .field("session_id", &self.session_id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Acquires and releases streams against one adapter
pub struct StreamAcquisition {
    backend: Arc<dyn CaptureBackend>,
    bindings: BindingTable,
}

impl StreamAcquisition {
    pub fn new(backend: Arc<dyn CaptureBackend>, bindings: BindingTable) -> Self {
        Self { backend, bindings }
    }

    pub fn backend(&self) -> &Arc<dyn CaptureBackend> {
        &self.backend
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Request a live stream for `session_id`
    ///
    /// Declined access, a missing device and an unsupported platform come
    /// back as distinct errors because callers recover from each differently.
    pub async fn acquire(
        &self,
        constraints: &Constraints,
        session_id: &str,
        events: Arc<dyn EventSink>,
    ) -> CaptureResult<BoundStream> {
        if let Some(device_id) = &constraints.device_id {
            if let Some(holder) = self.bindings.holder(device_id) {
                if holder != session_id {
                    return Err(CaptureError::DeviceBusy(format!(
                        "{} is bound to another session",
                        device_id
                    )));
                }
            }
        }

        tracing::debug!(
            "Requesting {} stream from {} (device: {:?})",
            constraints.kind,
            self.backend.name(),
            constraints.device_id
        );

        let stream = self
            .backend
            .request_access(constraints, events)
            .await
            .map_err(|e| ErrorReporter::classify(&e))?;

        if !self.bindings.try_bind(stream.device_id(), session_id) {
            stream.stop_tracks();
            return Err(CaptureError::DeviceBusy(format!(
                "{} is bound to another session",
                stream.device_id()
            )));
        }

        tracing::info!(
            "Acquired stream {} from {} ({})",
            stream.id(),
            stream.device_id(),
            stream.label()
        );

        Ok(BoundStream {
            stream,
            session_id: session_id.to_string(),
            released: AtomicBool::new(false),
        })
    }

    /// Stop every track and unbind the device
    ///
    /// Returns `true` if this call did the release; later calls are no-ops.
    pub fn release(&self, stream: &BoundStream) -> bool {
        if stream.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        stream.stream.stop_tracks();
        if self.bindings.holder(stream.device_id()).as_deref() == Some(stream.session_id()) {
            self.bindings.unbind(stream.device_id());
        }

        tracing::debug!("Released stream {} ({})", stream.id(), stream.device_id());
        true
    }
}
