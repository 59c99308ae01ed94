//! Error types and handling
//!
//! Common error types used across the capture engine. Frame-level variants
//! are absorbed on the producer side; session-level variants reach the
//! caller through the finish callback.

use crate::capture::frame::{MediaKind, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-wide error type
///
/// `Clone` so one finalize outcome can be handed to every waiter attached
/// to the same encoder.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("A capture session is already active")]
    AlreadyCapturing,

    #[error("Invalid output descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Writer not ready: {0}")]
    WriterNotReady(String),

    #[error("Out of order {track} frame: {got} is before last written {last}")]
    OutOfOrderFrame {
        track: MediaKind,
        last: Timestamp,
        got: Timestamp,
    },

    #[error("Encode queue saturated, frame dropped")]
    FrameDropped,

    #[error("Finalize failed: {0}")]
    FinalizeFailed(String),

    #[error("Camera cannot be reconfigured while capturing")]
    DeviceBusy,

    #[error("Unsupported frame format: {0}")]
    UnsupportedFormat(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture engine has shut down")]
    EngineStopped,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CaptureError {
    fn from(error: std::io::Error) -> Self {
        CaptureError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(error: serde_json::Error) -> Self {
        CaptureError::Config(error.to_string())
    }
}

/// Serializable error for callers outside the crate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<CaptureError> for ErrorResponse {
    fn from(error: CaptureError) -> Self {
        let code = match &error {
            CaptureError::AlreadyCapturing => "ALREADY_CAPTURING",
            CaptureError::InvalidDescriptor(_) => "INVALID_DESCRIPTOR",
            CaptureError::WriterNotReady(_) => "WRITER_NOT_READY",
            CaptureError::OutOfOrderFrame { .. } => "OUT_OF_ORDER_FRAME",
            CaptureError::FrameDropped => "FRAME_DROPPED",
            CaptureError::FinalizeFailed(_) => "FINALIZE_FAILED",
            CaptureError::DeviceBusy => "DEVICE_BUSY",
            CaptureError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            CaptureError::Device(_) => "DEVICE_ERROR",
            CaptureError::Config(_) => "CONFIG_ERROR",
            CaptureError::EngineStopped => "ENGINE_STOPPED",
            CaptureError::Io(_) => "IO_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_codes() {
        let response = ErrorResponse::from(CaptureError::AlreadyCapturing);
        assert_eq!(response.code, "ALREADY_CAPTURING");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let response = ErrorResponse::from(CaptureError::from(io));
        assert_eq!(response.code, "IO_ERROR");
        assert!(response.message.contains("gone"));
    }
}
