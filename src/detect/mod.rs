//! Metadata side-channel: QR/barcodes and faces
//!
//! Decoding itself is an external capability behind [`CodeDetector`] and
//! [`FaceDetector`]. This module filters results by the configured detection
//! mode. Codes are reported once per capture session until a different
//! payload shows up; faces are reported for every frame they are found in.

use crate::capture::frame::{FrameBuffer, MediaKind, Timestamp};
use serde::{Deserialize, Serialize};

/// Machine-readable code symbologies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Symbology {
    Qr,
    Aztec,
    Pdf417,
    Ean13,
    Ean8,
    Upce,
    Code39,
    Code39Mod43,
    Code93,
    Code128,
}

/// Which symbologies are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DetectionMode {
    /// QR codes only
    #[default]
    QrCode,
    /// Every supported 1D and 2D symbology
    BarCode,
    /// Faces only, no codes
    Face,
    None,
}

impl DetectionMode {
    pub fn accepts(&self, symbology: Symbology) -> bool {
        match self {
            DetectionMode::QrCode => symbology == Symbology::Qr,
            DetectionMode::BarCode => true,
            DetectionMode::Face | DetectionMode::None => false,
        }
    }
}

/// A decoded code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedCode {
    pub symbology: Symbology,
    pub payload: String,
}

impl DetectedCode {
    pub fn qr(payload: impl Into<String>) -> Self {
        Self {
            symbology: Symbology::Qr,
            payload: payload.into(),
        }
    }
}

/// Face rectangle in normalized frame coordinates, origin top-left
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A face found in one video frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedFace {
    /// Detector-assigned id that follows one face across frames
    pub face_id: Option<u64>,
    pub bounds: FaceBounds,
    /// Source timestamp of the frame, stamped by the side-channel
    #[serde(default)]
    pub pts: Timestamp,
}

impl DetectedFace {
    pub fn new(bounds: FaceBounds) -> Self {
        Self {
            face_id: None,
            bounds,
            pts: Timestamp::ZERO,
        }
    }

    pub fn with_id(mut self, face_id: u64) -> Self {
        self.face_id = Some(face_id);
        self
    }
}

/// Per-frame decoder. Must not keep state between frames.
pub trait CodeDetector: Send {
    fn detect(&self, frame: &FrameBuffer) -> Vec<DetectedCode>;
}

impl<F> CodeDetector for F
where
    F: Fn(&FrameBuffer) -> Vec<DetectedCode> + Send,
{
    fn detect(&self, frame: &FrameBuffer) -> Vec<DetectedCode> {
        self(frame)
    }
}

/// Per-frame face finder
pub trait FaceDetector: Send {
    fn detect_faces(&self, frame: &FrameBuffer) -> Vec<DetectedFace>;
}

impl<F> FaceDetector for F
where
    F: Fn(&FrameBuffer) -> Vec<DetectedFace> + Send,
{
    fn detect_faces(&self, frame: &FrameBuffer) -> Vec<DetectedFace> {
        self(frame)
    }
}

/// Mode filter plus per-session payload dedup around a detector
pub struct CodeSideChannel {
    detector: Option<Box<dyn CodeDetector>>,
    mode: DetectionMode,
    last_payload: Option<String>,
}

impl CodeSideChannel {
    pub fn new(mode: DetectionMode) -> Self {
        Self {
            detector: None,
            mode,
            last_payload: None,
        }
    }

    pub fn set_detector(&mut self, detector: Box<dyn CodeDetector>) {
        self.detector = Some(detector);
    }

    pub fn set_mode(&mut self, mode: DetectionMode) {
        self.mode = mode;
    }

    /// Whether decoding can produce anything at all
    pub fn is_active(&self) -> bool {
        self.detector.is_some() && matches!(self.mode, DetectionMode::QrCode | DetectionMode::BarCode)
    }

    /// Forget the last reported payload. Called when a session starts.
    pub fn reset(&mut self) {
        self.last_payload = None;
    }

    /// Decode one frame. Returns a code only when its payload differs from
    /// the last one reported; frames without a code leave that untouched.
    pub fn process(&mut self, frame: &FrameBuffer) -> Option<DetectedCode> {
        if !self.is_active() {
            return None;
        }
        let detector = self.detector.as_ref()?;

        let code = detector
            .detect(frame)
            .into_iter()
            .find(|code| self.mode.accepts(code.symbology))?;

        if self.last_payload.as_deref() == Some(code.payload.as_str()) {
            return None;
        }

        tracing::debug!("Detected {:?} code: {}", code.symbology, code.payload);
        self.last_payload = Some(code.payload.clone());
        Some(code)
    }
}

/// Mode filter around a face detector. Only video frames are inspected.
pub struct FaceSideChannel {
    detector: Option<Box<dyn FaceDetector>>,
    mode: DetectionMode,
}

impl FaceSideChannel {
    pub fn new(mode: DetectionMode) -> Self {
        Self {
            detector: None,
            mode,
        }
    }

    pub fn set_detector(&mut self, detector: Box<dyn FaceDetector>) {
        self.detector = Some(detector);
    }

    pub fn set_mode(&mut self, mode: DetectionMode) {
        self.mode = mode;
    }

    pub fn is_active(&self) -> bool {
        self.detector.is_some() && self.mode == DetectionMode::Face
    }

    /// Faces in one frame, each stamped with the frame's timestamp
    pub fn process(&self, frame: &FrameBuffer) -> Vec<DetectedFace> {
        if !self.is_active() || frame.kind() != MediaKind::Video {
            return Vec::new();
        }
        let Some(detector) = self.detector.as_ref() else {
            return Vec::new();
        };

        let mut faces = detector.detect_faces(frame);
        for face in faces.iter_mut() {
            face.pts = frame.pts();
        }
        if !faces.is_empty() {
            tracing::trace!("Detected {} face(s) at {}", faces.len(), frame.pts());
        }
        faces
    }
}
