//! Device registry
//!
//! Enumerates capture sources and normalizes what the platform reports:
//! stable ids, fallback labels before permission, and the bound flag.

use super::acquisition::BindingTable;
use super::traits::{CaptureBackend, DeviceDescriptor, DeviceKind, PermissionStatus, RawDevice};
use crate::utils::error::{CaptureError, CaptureResult};
use std::sync::Arc;

/// Query-only view over an adapter's devices
pub struct DeviceRegistry {
    backend: Arc<dyn CaptureBackend>,
    bindings: BindingTable,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn CaptureBackend>, bindings: BindingTable) -> Self {
        Self { backend, bindings }
    }

    /// List available sources of `kind`
    ///
    /// Finding no devices returns an empty list; only a rejected
    /// enumeration is an error.
    pub async fn list_devices(&self, kind: DeviceKind) -> CaptureResult<Vec<DeviceDescriptor>> {
        let raw = self.backend.enumerate(kind).await.map_err(|e| {
            tracing::warn!("Device enumeration rejected by {}: {}", self.backend.name(), e);
            CaptureError::EnumerationFailed(e.message)
        })?;

        let devices = normalize(kind, raw, &self.bindings);
        tracing::debug!("Found {} {} device(s)", devices.len(), kind);
        Ok(devices)
    }

    /// Look up a single device by id
    pub async fn find(&self, kind: DeviceKind, id: &str) -> CaptureResult<Option<DeviceDescriptor>> {
        Ok(self
            .list_devices(kind)
            .await?
            .into_iter()
            .find(|d| d.id == id))
    }

    /// Permission state without prompting
    pub async fn permission_status(&self, kind: DeviceKind) -> PermissionStatus {
        self.backend.permission(kind).await
    }
}

/// Give every device a stable id and a label
fn normalize(kind: DeviceKind, raw: Vec<RawDevice>, bindings: &BindingTable) -> Vec<DeviceDescriptor> {
    raw.into_iter()
        .enumerate()
        .map(|(index, device)| {
            let id = if device.id.trim().is_empty() {
                format!("{}-{}", kind, index)
            } else {
                device.id
            };

            let label = if device.label.trim().is_empty() {
                format!("{} {}", kind.fallback_label(), index + 1)
            } else {
                device.label
            };

            DeviceDescriptor {
                bound: bindings.is_bound(&id),
                id,
                label,
                kind,
                is_default: device.is_default,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::virtual_source::{VirtualBackend, VirtualDevice};
    use crate::utils::error::{PlatformError, PlatformErrorCode};

    #[test]
    fn test_normalize_fills_missing_ids_and_labels() {
        let raw = vec![
            RawDevice::new("", ""),
            RawDevice::new("usb-7", "USB Mic"),
        ];

        let devices = normalize(DeviceKind::AudioInput, raw, &BindingTable::new());

        assert_eq!(devices[0].id, "audioinput-0");
        assert_eq!(devices[0].label, "Microphone 1");
        assert_eq!(devices[1].id, "usb-7");
        assert_eq!(devices[1].label, "USB Mic");
    }

    #[test]
    fn test_normalize_marks_bound_devices() {
        let bindings = BindingTable::new();
        bindings.try_bind("display-1", "session");

        let devices = normalize(
            DeviceKind::DisplaySurface,
            vec![RawDevice::new("display-1", "Main"), RawDevice::new("display-2", "")],
            &bindings,
        );

        assert!(devices[0].bound);
        assert!(!devices[1].bound);
        assert_eq!(devices[1].label, "Display 2");
    }

    #[tokio::test]
    async fn test_empty_list_is_not_an_error() {
        let backend = Arc::new(VirtualBackend::new(vec![VirtualDevice::new(
            DeviceKind::AudioInput,
            "mic-1",
            "Mic",
        )]));
        let registry = DeviceRegistry::new(backend, BindingTable::new());

        let displays = registry.list_devices(DeviceKind::DisplaySurface).await.unwrap();
        assert!(displays.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_enumeration_is_device_error() {
        let backend = Arc::new(VirtualBackend::with_microphone());
        backend.fail_enumeration(Some(PlatformError::new(
            PlatformErrorCode::AccessDenied,
            "blocked by policy",
        )));
        let registry = DeviceRegistry::new(backend, BindingTable::new());

        let result = registry.list_devices(DeviceKind::AudioInput).await;
        assert!(matches!(result, Err(CaptureError::EnumerationFailed(_))));
    }

    #[tokio::test]
    async fn test_fallback_label_before_permission() {
        let backend = Arc::new(VirtualBackend::with_standard_devices());
        let registry = DeviceRegistry::new(backend.clone(), BindingTable::new());

        let mics = registry.list_devices(DeviceKind::AudioInput).await.unwrap();
        assert_eq!(mics.len(), 2);
        assert_eq!(mics[0].label, "Microphone 1");
        assert!(mics[0].is_default);
        assert_eq!(
            registry.permission_status(DeviceKind::AudioInput).await,
            PermissionStatus::Prompt
        );

        backend.set_permission(DeviceKind::AudioInput, PermissionStatus::Granted);
        let found = registry.find(DeviceKind::AudioInput, "mic-2").await.unwrap();
        assert_eq!(found.map(|d| d.label), Some("USB Microphone".to_string()));
    }
}
