use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::camera::CameraError;
use crate::core::matcher::MatchError;
use crate::core::model::Identity;
use crate::core::orchestrator::State;
use crate::storage::StorageError;

/// Stable classification of everything that can end a capture/submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    DeviceBusy,
    Unsupported,
    NoFrameAvailable,
    NoReferenceEnrolled,
    UploadFailed,
    MatchServiceError,
    Storage,
    Cancelled,
    InvalidState,
}

impl ErrorKind {
    /// Message suitable for showing to the person in front of the camera.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied =>
                "Camera access was denied. Allow this application to use the camera in your system settings, then try again.",
            ErrorKind::DeviceUnavailable =>
                "No working camera was found. Check that a camera is connected and switched on, then try again.",
            ErrorKind::DeviceBusy =>
                "The camera is being used by another application. Close that application, then try again.",
            ErrorKind::Unsupported =>
                "This camera does not support the required video settings. Try a different camera.",
            ErrorKind::NoFrameAvailable =>
                "The camera has not produced a picture yet. Wait a moment, then capture again.",
            ErrorKind::NoReferenceEnrolled =>
                "No reference photo is registered for you yet. Ask an administrator to register one first.",
            ErrorKind::UploadFailed =>
                "Your photo could not be saved. Check the connection and try again.",
            ErrorKind::MatchServiceError =>
                "Face comparison is unavailable right now. Please try again in a few minutes.",
            ErrorKind::Storage =>
                "A storage error occurred while saving the result. Please try again or contact an administrator.",
            ErrorKind::Cancelled =>
                "Capture was cancelled.",
            ErrorKind::InvalidState =>
                "That action is not available right now.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::DeviceBusy => "device_busy",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::NoFrameAvailable => "no_frame_available",
            ErrorKind::NoReferenceEnrolled => "no_reference_enrolled",
            ErrorKind::UploadFailed => "upload_failed",
            ErrorKind::MatchServiceError => "match_service_error",
            ErrorKind::Storage => "storage",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidState => "invalid_state",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("No active reference enrolled for '{0}'")]
    NoReferenceEnrolled(Identity),

    #[error("Image upload failed: {0}")]
    UploadFailed(#[source] StorageError),

    #[error("Match service error: {0}")]
    MatchService(#[from] MatchError),

    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("Capture cancelled")]
    Cancelled,

    #[error("Cannot {operation} while {state}")]
    InvalidState { operation: &'static str, state: State },
}

impl VerificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VerificationError::Camera(e) => match e {
                CameraError::PermissionDenied(_) => ErrorKind::PermissionDenied,
                CameraError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
                CameraError::DeviceBusy(_) => ErrorKind::DeviceBusy,
                CameraError::Unsupported(_) => ErrorKind::Unsupported,
                CameraError::NoFrameAvailable => ErrorKind::NoFrameAvailable,
            },
            VerificationError::NoReferenceEnrolled(_) => ErrorKind::NoReferenceEnrolled,
            VerificationError::UploadFailed(_) => ErrorKind::UploadFailed,
            VerificationError::MatchService(_) => ErrorKind::MatchServiceError,
            VerificationError::Storage(_) => ErrorKind::Storage,
            VerificationError::Cancelled => ErrorKind::Cancelled,
            VerificationError::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind().user_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_errors_map_to_kinds() {
        let denied: VerificationError = CameraError::PermissionDenied("EACCES".into()).into();
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);
        assert!(denied.user_message().contains("Allow"));

        let busy: VerificationError = CameraError::DeviceBusy("EBUSY".into()).into();
        assert_eq!(busy.kind(), ErrorKind::DeviceBusy);
        assert!(busy.user_message().contains("another application"));
    }

    #[test]
    fn test_messages_do_not_leak_internals() {
        let err = VerificationError::Storage(StorageError::Corrupt("/var/lib/x.bincode".into()));
        assert!(!err.user_message().contains("/var/lib"));
        assert!(err.to_string().contains("/var/lib"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::MatchServiceError.to_string(), "match_service_error");
        assert_eq!(serde_json::to_string(&ErrorKind::NoReferenceEnrolled).unwrap(), "\"no_reference_enrolled\"");
    }
}
