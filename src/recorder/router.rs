//! Frame router
//!
//! Fans one frame out to the interested consumers in a fixed order:
//! encoder, code detector, face detector, progress, then any pending photo
//! requests. Nothing here waits on the encoder; a saturated encoder drops
//! the frame. Photos are encoded on the blocking pool and delivered through
//! the callback context.

use crate::capture::frame::{FrameBuffer, MediaKind, Timestamp};
use crate::detect::{
    CodeDetector, CodeSideChannel, DetectedCode, DetectionMode, FaceDetector, FaceSideChannel,
};
use crate::encoder::stream::StreamEncoder;
use crate::recorder::callbacks::{CallbackEvent, CallbackSink, PhotoCallback};
use crate::recorder::photo;
use crate::recorder::state::{CaptureState, ProgressReport, SessionId};
use crate::utils::error::CaptureError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A consumer the router handed a frame to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumer {
    Encoder,
    CodeDetector,
    FaceDetector,
    Progress,
    Photo,
}

/// Encoder and output timestamp for a frame that should be encoded
pub struct EncodeTarget<'a> {
    pub encoder: &'a StreamEncoder,
    pub pts: Timestamp,
}

/// Session context for progress reports
#[derive(Debug, Clone, Copy)]
pub struct RouteContext {
    pub session_id: Option<SessionId>,
    pub state: CaptureState,
    pub elapsed: Duration,
}

/// What happened to one routed frame
#[derive(Debug, Clone, Default)]
pub struct RouteReport {
    /// Consumers in the order they were invoked
    pub visited: Vec<Consumer>,
    /// `Some(Ok)` if encoded, `Some(Err)` if the encoder refused it
    pub encode: Option<Result<(), CaptureError>>,
    pub code: Option<DetectedCode>,
    pub faces: usize,
    /// Photo requests handed to the blocking pool
    pub photos: usize,
}

impl RouteReport {
    pub fn encoded(&self) -> bool {
        matches!(self.encode, Some(Ok(())))
    }
}

/// Router counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub routed: u64,
    pub encoded: u64,
    /// Refused because the encode queue was saturated
    pub dropped: u64,
    /// Refused for ordering or writer state
    pub rejected: u64,
    pub codes_reported: u64,
    pub faces_reported: u64,
    pub photos: u64,
}

pub struct FrameRouter {
    callbacks: CallbackSink,
    codes: CodeSideChannel,
    faces: FaceSideChannel,
    code_callback: bool,
    face_callback: bool,
    progress_callback: bool,
    pending_photos: Vec<PhotoCallback>,
    stats: RouterStats,
}

impl FrameRouter {
    pub fn new(callbacks: CallbackSink, mode: DetectionMode) -> Self {
        Self {
            callbacks,
            codes: CodeSideChannel::new(mode),
            faces: FaceSideChannel::new(mode),
            code_callback: false,
            face_callback: false,
            progress_callback: false,
            pending_photos: Vec::new(),
            stats: RouterStats::default(),
        }
    }

    pub fn set_code_callback(&mut self, registered: bool) {
        self.code_callback = registered;
    }

    pub fn set_face_callback(&mut self, registered: bool) {
        self.face_callback = registered;
    }

    pub fn set_progress_callback(&mut self, registered: bool) {
        self.progress_callback = registered;
    }

    pub fn set_detector(&mut self, detector: Box<dyn CodeDetector>) {
        self.codes.set_detector(detector);
    }

    pub fn set_face_detector(&mut self, detector: Box<dyn FaceDetector>) {
        self.faces.set_detector(detector);
    }

    pub fn set_detection_mode(&mut self, mode: DetectionMode) {
        self.codes.set_mode(mode);
        self.faces.set_mode(mode);
    }

    /// Start payload dedup over for a new session
    pub fn reset_codes(&mut self) {
        self.codes.reset();
    }

    /// Serve `callback` from the next video frame
    pub fn request_photo(&mut self, callback: PhotoCallback) {
        self.pending_photos.push(callback);
    }

    /// Fail every pending photo request
    pub fn cancel_photos(&mut self, error: CaptureError) {
        for callback in self.pending_photos.drain(..) {
            self.callbacks.send(CallbackEvent::Photo {
                callback,
                result: Err(error.clone()),
            });
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Dispatch one frame to every interested consumer
    pub fn route(
        &mut self,
        frame: FrameBuffer,
        target: Option<EncodeTarget<'_>>,
        context: RouteContext,
    ) -> RouteReport {
        let mut report = RouteReport::default();
        self.stats.routed += 1;

        if let Some(target) = target {
            report.visited.push(Consumer::Encoder);
            let outgoing = if target.pts == frame.pts() {
                frame.clone()
            } else {
                frame.with_pts(target.pts)
            };
            let result = target.encoder.try_encode_frame(outgoing);
            match &result {
                Ok(()) => self.stats.encoded += 1,
                Err(CaptureError::FrameDropped) => {
                    self.stats.dropped += 1;
                    tracing::trace!("Encoder saturated, dropped {} frame at {}", frame.kind(), target.pts);
                }
                Err(e) => {
                    self.stats.rejected += 1;
                    tracing::debug!("Encoder refused {} frame: {}", frame.kind(), e);
                }
            }
            report.encode = Some(result);
        }

        if self.code_callback && self.codes.is_active() {
            report.visited.push(Consumer::CodeDetector);
            if let Some(code) = self.codes.process(&frame) {
                self.stats.codes_reported += 1;
                self.callbacks.send(CallbackEvent::CodeDetected(code.clone()));
                report.code = Some(code);
            }
        }

        if self.face_callback && self.faces.is_active() {
            report.visited.push(Consumer::FaceDetector);
            let faces = self.faces.process(&frame);
            report.faces = faces.len();
            self.stats.faces_reported += faces.len() as u64;
            for face in faces {
                self.callbacks.send(CallbackEvent::FaceDetected(face));
            }
        }

        if self.progress_callback {
            report.visited.push(Consumer::Progress);
            self.callbacks.send(CallbackEvent::Progress(ProgressReport {
                session_id: context.session_id,
                state: context.state,
                elapsed: context.elapsed,
                frame: frame.clone(),
            }));
        }

        if frame.kind() == MediaKind::Video && !self.pending_photos.is_empty() {
            report.visited.push(Consumer::Photo);
            let pending = std::mem::take(&mut self.pending_photos);
            report.photos = pending.len();
            self.stats.photos += report.photos as u64;

            // the payload is shared, so the clone is cheap
            let callbacks = self.callbacks.clone();
            let frame = frame.clone();
            tokio::task::spawn_blocking(move || {
                let result = photo::snapshot(&frame);
                if let Err(e) = &result {
                    tracing::warn!("Photo from frame at {} failed: {}", frame.pts(), e);
                }
                for callback in pending {
                    callbacks.send(CallbackEvent::Photo {
                        callback,
                        result: result.clone(),
                    });
                }
            });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::detect::{DetectedFace, FaceBounds};
    use crate::encoder::{EncoderOptions, ManifestWriterFactory, OutputDescriptor};
    use crate::recorder::callbacks::spawn_dispatcher;
    use crate::recorder::photo::CapturedPhoto;
    use crate::utils::error::CaptureResult;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn frame(ms: i64, value: u8) -> FrameBuffer {
        FrameBuffer::video(Timestamp::from_millis(ms), 1, 1, PixelFormat::Rgba, vec![value, 0, 0, 255])
    }

    fn context(state: CaptureState) -> RouteContext {
        RouteContext {
            session_id: None,
            state,
            elapsed: Duration::ZERO,
        }
    }

    fn qr_from_first_byte() -> Box<dyn CodeDetector> {
        Box::new(|frame: &FrameBuffer| match frame.payload().first() {
            Some(0) | None => Vec::new(),
            Some(n) => vec![DetectedCode::qr(format!("code-{}", n))],
        })
    }

    #[tokio::test]
    async fn test_consumers_visited_in_fixed_order() {
        let dir = tempdir().unwrap();
        let (sink, _handle) = spawn_dispatcher();
        let encoder = StreamEncoder::create(
            OutputDescriptor::new(dir.path().join("t.json"), 1, 1, 1, 8_000),
            &ManifestWriterFactory,
            EncoderOptions::default(),
        )
        .unwrap();

        let mut router = FrameRouter::new(sink.clone(), DetectionMode::QrCode);
        router.set_detector(qr_from_first_byte());
        router.set_code_callback(true);
        router.set_progress_callback(true);

        let (tx, rx) = tokio::sync::oneshot::channel();
        router.request_photo(Box::new(move |result: CaptureResult<CapturedPhoto>| {
            let _ = tx.send(result.is_ok());
        }));

        let report = router.route(
            frame(0, 7),
            Some(EncodeTarget {
                encoder: &encoder,
                pts: Timestamp::ZERO,
            }),
            context(CaptureState::Capturing),
        );

        assert_eq!(
            report.visited,
            vec![
                Consumer::Encoder,
                Consumer::CodeDetector,
                Consumer::Progress,
                Consumer::Photo
            ]
        );
        assert!(report.encoded());
        assert_eq!(report.code, Some(DetectedCode::qr("code-7")));
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_without_encoder_only_side_consumers_run() {
        let (sink, _handle) = spawn_dispatcher();
        let mut router = FrameRouter::new(sink.clone(), DetectionMode::QrCode);
        router.set_progress_callback(true);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        sink.send(CallbackEvent::SetProgressCallback(Some(Box::new(
            move |report: ProgressReport| log.lock().push((report.state, report.frame.pts())),
        ))));

        let report = router.route(frame(10, 0), None, context(CaptureState::Paused));
        assert_eq!(report.visited, vec![Consumer::Progress]);
        assert!(report.encode.is_none());

        sink.flush().await;
        assert_eq!(
            *seen.lock(),
            vec![(CaptureState::Paused, Timestamp::from_millis(10))]
        );
    }

    #[tokio::test]
    async fn test_faces_routed_in_face_mode() {
        let (sink, _handle) = spawn_dispatcher();
        let mut router = FrameRouter::new(sink.clone(), DetectionMode::QrCode);
        router.set_detector(qr_from_first_byte());
        router.set_face_detector(Box::new(|frame: &FrameBuffer| {
            (0..frame.payload()[0])
                .map(|n| {
                    DetectedFace::new(FaceBounds {
                        x: 0.1 * n as f32,
                        y: 0.0,
                        width: 0.1,
                        height: 0.1,
                    })
                })
                .collect()
        }));
        router.set_code_callback(true);
        router.set_face_callback(true);

        let faces = Arc::new(Mutex::new(Vec::new()));
        let log = faces.clone();
        sink.send(CallbackEvent::SetFaceCallback(Some(Box::new(move |face: DetectedFace| {
            log.lock().push(face.pts)
        }))));

        // QR mode: faces are not looked for
        let report = router.route(frame(0, 2), None, context(CaptureState::Idle));
        assert_eq!(report.visited, vec![Consumer::CodeDetector]);

        router.set_detection_mode(DetectionMode::Face);
        let report = router.route(frame(40, 2), None, context(CaptureState::Idle));
        assert_eq!(report.visited, vec![Consumer::FaceDetector]);
        assert_eq!(report.faces, 2);
        assert!(report.code.is_none());
        router.route(frame(80, 1), None, context(CaptureState::Idle));

        sink.flush().await;
        assert_eq!(
            *faces.lock(),
            vec![
                Timestamp::from_millis(40),
                Timestamp::from_millis(40),
                Timestamp::from_millis(80)
            ]
        );
        assert_eq!(router.stats().faces_reported, 3);
    }

    #[tokio::test]
    async fn test_photo_encoded_off_the_routing_path() {
        let (sink, _handle) = spawn_dispatcher();
        let mut router = FrameRouter::new(sink, DetectionMode::None);

        let (width, height) = (1920, 1080);
        let large = || {
            FrameBuffer::video(
                Timestamp::from_millis(5),
                width,
                height,
                PixelFormat::Nv12,
                vec![90u8; PixelFormat::Nv12.frame_size(width, height)],
            )
        };
        let started = std::time::Instant::now();
        photo::snapshot(&large()).unwrap();
        let encode_cost = started.elapsed();

        let (tx, rx) = tokio::sync::oneshot::channel();
        router.request_photo(Box::new(move |result: CaptureResult<CapturedPhoto>| {
            let _ = tx.send(result);
        }));
        let frame = large();
        let started = std::time::Instant::now();
        let report = router.route(frame, None, context(CaptureState::Capturing));
        let route_cost = started.elapsed();

        assert_eq!(report.photos, 1);
        assert!(
            route_cost < encode_cost / 4,
            "routing took {:?}, encoding takes {:?}",
            route_cost,
            encode_cost
        );
        let photo = rx.await.unwrap().unwrap();
        assert_eq!((photo.width, photo.height), (width, height));
        assert_eq!(photo.pts, Timestamp::from_millis(5));
    }

    #[tokio::test]
    async fn test_detector_skipped_without_code_callback() {
        let (sink, _handle) = spawn_dispatcher();
        let mut router = FrameRouter::new(sink, DetectionMode::QrCode);
        router.set_detector(qr_from_first_byte());

        let report = router.route(frame(0, 3), None, context(CaptureState::Idle));
        assert!(report.visited.is_empty());
        assert!(report.code.is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_frame_counted_as_rejected() {
        let dir = tempdir().unwrap();
        let (sink, _handle) = spawn_dispatcher();
        let encoder = StreamEncoder::create(
            OutputDescriptor::new(dir.path().join("t.json"), 1, 1, 1, 8_000),
            &ManifestWriterFactory,
            EncoderOptions::default(),
        )
        .unwrap();
        let mut router = FrameRouter::new(sink, DetectionMode::None);

        for ms in [0, 33, 20] {
            router.route(
                frame(ms, 0),
                Some(EncodeTarget {
                    encoder: &encoder,
                    pts: Timestamp::from_millis(ms),
                }),
                context(CaptureState::Capturing),
            );
        }

        let stats = router.stats();
        assert_eq!(stats.routed, 3);
        assert_eq!(stats.encoded, 2);
        assert_eq!(stats.rejected, 1);
    }
}
