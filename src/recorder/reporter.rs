//! Error classification
//!
//! Turns platform failures into the engine's taxonomy and into the error
//! values callers render.

use crate::utils::error::{CaptureError, ErrorKind, PlatformError, PlatformErrorCode, RecoveryAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A classified failure as callers see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,

    /// Originating platform error, for diagnostics
    pub detail: Option<String>,

    pub recovery: RecoveryAction,
    pub at: DateTime<Utc>,
}

/// Maps failure surfaces into [`CaptureError`]s and reports them
pub struct ErrorReporter;

impl ErrorReporter {
    /// Classify an adapter failure
    pub fn classify(error: &PlatformError) -> CaptureError {
        let message = error.message.clone();
        match error.code {
            PlatformErrorCode::AccessDenied => CaptureError::PermissionDenied(message),
            PlatformErrorCode::NotFound | PlatformErrorCode::Overconstrained => {
                CaptureError::DeviceNotFound(message)
            }
            PlatformErrorCode::NotReadable => CaptureError::DeviceBusy(message),
            PlatformErrorCode::Ended => CaptureError::DeviceDisconnected(message),
            PlatformErrorCode::NotSupported => CaptureError::Unsupported(message),
            PlatformErrorCode::FormatUnavailable => CaptureError::UnsupportedFormat(message),
            PlatformErrorCode::EncoderFault
            | PlatformErrorCode::Aborted
            | PlatformErrorCode::Unknown => CaptureError::RecorderFault(message),
        }
    }

    /// Build the caller-facing value for `error` and log it
    pub fn report(error: &CaptureError, origin: Option<&PlatformError>) -> ReportedError {
        let reported = ReportedError {
            kind: error.kind(),
            message: error.to_string(),
            detail: origin.map(|e| e.to_string()),
            recovery: error.recovery(),
            at: Utc::now(),
        };

        if error.is_fatal() {
            tracing::error!("Capture failed ({}): {}", reported.kind, reported.message);
        } else {
            tracing::warn!("Capture issue ({}): {}", reported.kind, reported.message);
        }

        reported
    }
}
