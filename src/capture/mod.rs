//! Frame producers
//!
//! The frame model, the producer-side sink, a synthetic source and, with the
//! `hardware` feature, webcam and microphone sources.

pub mod frame;
pub mod synthetic;
pub mod traits;

#[cfg(feature = "hardware")]
pub mod microphone;
#[cfg(feature = "hardware")]
pub mod webcam;

pub use frame::{FrameBuffer, FrameFormat, MediaKind, PixelFormat, Timestamp};
pub use synthetic::{TestPatternSource, ToneSource};
pub use traits::{CameraInfo, FrameSink, FrameSource, Resolution};

/// Enumerate cameras. Empty without the `hardware` feature.
pub fn list_cameras() -> Vec<CameraInfo> {
    #[cfg(feature = "hardware")]
    {
        webcam::list_cameras()
    }

    #[cfg(not(feature = "hardware"))]
    {
        Vec::new()
    }
}
