//! Error types and handling
//!
//! Common error types used across the engine. Adapters report
//! [`PlatformError`]s, the engine surfaces [`CaptureError`]s.

use crate::recorder::state::{Command, SessionState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by the engine and downstream layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// User or platform declined access
    Permission,
    /// No matching source, source vanished, or source busy
    Device,
    /// Native recorder faulted
    Recording,
    /// Requested output encoding is not supported
    Format,
    /// Artifact hand-off for upload failed
    Network,
    /// Command rejected by the state machine
    InvalidState,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Permission => write!(f, "permission"),
            ErrorKind::Device => write!(f, "device"),
            ErrorKind::Recording => write!(f, "recording"),
            ErrorKind::Format => write!(f, "format"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::InvalidState => write!(f, "invalid-state"),
        }
    }
}

/// What a caller should offer the user after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    /// Show a re-prompt affordance, never retry automatically
    RePrompt,
    /// Let the user pick another device
    SelectDevice,
    /// Hide the capture feature on this platform
    DisableFeature,
    /// Surface the error and allow a manual restart
    ManualRestart,
    /// Continue with the format the engine chose
    AcceptFallback,
    /// Retry the upload later
    RetryLater,
    /// Fix the calling code
    None,
}

/// Engine error surface
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Capture not supported: {0}")]
    Unsupported(String),

    #[error("Recorder error: {0}")]
    RecorderFault(String),

    #[error("Recording exceeded the maximum size of {limit} bytes")]
    MaxSizeExceeded { limit: u64 },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Cannot {command} while session is {state}")]
    InvalidTransition {
        command: Command,
        state: SessionState,
    },

    #[error("Another {0} is already in progress")]
    Busy(Command),

    #[error("Session was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),
}

impl CaptureError {
    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::PermissionDenied(_) => ErrorKind::Permission,
            CaptureError::DeviceNotFound(_)
            | CaptureError::DeviceDisconnected(_)
            | CaptureError::DeviceBusy(_)
            | CaptureError::EnumerationFailed(_) => ErrorKind::Device,
            CaptureError::Unsupported(_)
            | CaptureError::RecorderFault(_)
            | CaptureError::MaxSizeExceeded { .. }
            | CaptureError::Io(_) => ErrorKind::Recording,
            CaptureError::UnsupportedFormat(_) => ErrorKind::Format,
            CaptureError::Network(_) => ErrorKind::Network,
            CaptureError::InvalidTransition { .. }
            | CaptureError::Busy(_)
            | CaptureError::Cancelled => ErrorKind::InvalidState,
        }
    }

    /// Recommended caller action
    pub fn recovery(&self) -> RecoveryAction {
        match self {
            CaptureError::PermissionDenied(_) => RecoveryAction::RePrompt,
            CaptureError::DeviceNotFound(_)
            | CaptureError::DeviceDisconnected(_)
            | CaptureError::DeviceBusy(_)
            | CaptureError::EnumerationFailed(_) => RecoveryAction::SelectDevice,
            CaptureError::Unsupported(_) => RecoveryAction::DisableFeature,
            CaptureError::RecorderFault(_)
            | CaptureError::MaxSizeExceeded { .. }
            | CaptureError::Io(_) => RecoveryAction::ManualRestart,
            CaptureError::UnsupportedFormat(_) => RecoveryAction::AcceptFallback,
            CaptureError::Network(_) => RecoveryAction::RetryLater,
            CaptureError::InvalidTransition { .. }
            | CaptureError::Busy(_)
            | CaptureError::Cancelled => RecoveryAction::None,
        }
    }

    /// Whether this error moves a live session into `Failed`
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::InvalidState | ErrorKind::Format | ErrorKind::Network
        )
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(error: std::io::Error) -> Self {
        CaptureError::Io(error.to_string())
    }
}

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Raw failure codes reported by source adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformErrorCode {
    /// The permission prompt was rejected
    AccessDenied,
    /// No source matches the constraints
    NotFound,
    /// The source exists but another client holds it
    NotReadable,
    /// Constraints cannot be satisfied by any source
    Overconstrained,
    /// The platform has no capture support
    NotSupported,
    /// The source went away mid-session
    Ended,
    /// The recorder primitive faulted
    EncoderFault,
    /// The encoding is not available
    FormatUnavailable,
    /// The operation was aborted by the platform
    Aborted,
    Unknown,
}

/// Failure reported by a platform adapter
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code:?}: {message}")]
pub struct PlatformError {
    pub code: PlatformErrorCode,
    pub message: String,
}

impl PlatformError {
    pub fn new(code: PlatformErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Misuse of the chunk buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Chunk appended while session is {0}")]
    NotAccepting(SessionState),

    #[error("Buffer already finalized")]
    AlreadyFinalized,
}

impl From<ChunkError> for CaptureError {
    fn from(error: ChunkError) -> Self {
        CaptureError::RecorderFault(error.to_string())
    }
}

/// Invalid engine configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Error response for front ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&CaptureError> for ErrorResponse {
    fn from(error: &CaptureError) -> Self {
        let code = match error.kind() {
            ErrorKind::Permission => "PERMISSION_ERROR",
            ErrorKind::Device => "DEVICE_ERROR",
            ErrorKind::Recording => "RECORDING_ERROR",
            ErrorKind::Format => "FORMAT_ERROR",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::InvalidState => "INVALID_STATE",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            CaptureError::PermissionDenied("no".into()).kind(),
            ErrorKind::Permission
        );
        assert_eq!(CaptureError::DeviceBusy("mic".into()).kind(), ErrorKind::Device);
        assert_eq!(
            CaptureError::MaxSizeExceeded { limit: 10 }.kind(),
            ErrorKind::Recording
        );
        assert_eq!(
            CaptureError::UnsupportedFormat("x".into()).kind(),
            ErrorKind::Format
        );
    }

    #[test]
    fn test_recovery_differs_by_acquisition_failure() {
        let declined = CaptureError::PermissionDenied("declined".into());
        let missing = CaptureError::DeviceNotFound("none".into());
        let unsupported = CaptureError::Unsupported("no api".into());

        assert_eq!(declined.recovery(), RecoveryAction::RePrompt);
        assert_eq!(missing.recovery(), RecoveryAction::SelectDevice);
        assert_eq!(unsupported.recovery(), RecoveryAction::DisableFeature);
    }

    #[test]
    fn test_rejections_are_not_fatal() {
        let rejected = CaptureError::InvalidTransition {
            command: Command::Pause,
            state: SessionState::Idle,
        };
        assert!(!rejected.is_fatal());
        assert!(CaptureError::RecorderFault("boom".into()).is_fatal());
    }

    #[test]
    fn test_error_response_code() {
        let response = ErrorResponse::from(&CaptureError::DeviceDisconnected("usb".into()));
        assert_eq!(response.code, "DEVICE_ERROR");
        assert_eq!(response.message, "Device disconnected: usb");
    }
}
