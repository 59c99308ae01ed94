//! Capture session controller
//!
//! Owns the capture state machine and the current session. Every routed
//! frame passes through [`CaptureSessionController::on_frame`], which decides
//! whether the encoder sees it and at which re-based timestamp. Finalize runs
//! on the encode worker; its outcome comes back through the
//! [`FinishNotifier`] and is applied with
//! [`CaptureSessionController::on_finalized`] on the owning context.

use crate::capture::frame::{FrameBuffer, Timestamp};
use crate::config::{DevicePosition, EngineConfig};
use crate::detect::{CodeDetector, FaceDetector};
use crate::encoder::descriptor::OutputDescriptor;
use crate::encoder::stream::{EncoderStats, FinishOutcome, StreamEncoder};
use crate::encoder::writer::WriterFactory;
use crate::recorder::callbacks::{CallbackEvent, CallbackSink, FinishedCallback, PhotoCallback};
use crate::recorder::router::{EncodeTarget, FrameRouter, RouteContext, RouteReport, RouterStats};
use crate::recorder::state::{CaptureOutput, CaptureState, CommandOutcome, SessionId, StateChange};
use crate::recorder::timeline::Timeline;
use crate::storage;
use crate::utils::error::{CaptureError, CaptureResult, ErrorResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Encoder outcome plus the auto-save copy, if one was made
#[derive(Debug, Clone)]
pub struct FinalizeReport {
    pub outcome: FinishOutcome,
    pub library_path: Option<PathBuf>,
}

/// Posts a finalize outcome back to the context that owns the controller.
/// Called from the encode worker thread.
pub type FinishNotifier = Arc<dyn Fn(SessionId, FinalizeReport) + Send + Sync>;

/// Controller snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStats {
    pub state: CaptureState,
    pub session_id: Option<SessionId>,
    pub elapsed_ms: f64,
    pub paused_ms: f64,
    pub router: RouterStats,
    pub encoder: Option<EncoderStats>,
    /// Failure of the most recent session, if it failed
    pub last_error: Option<ErrorResponse>,
}

struct CaptureSession {
    id: SessionId,
    started_at: DateTime<Utc>,
    max_duration: Option<Duration>,
    timeline: Timeline,
    encoder: StreamEncoder,
    on_finished: Option<FinishedCallback>,
}

impl CaptureSession {
    fn output(&self, report: FinalizeReport) -> CaptureResult<CaptureOutput> {
        let path = report.outcome?;
        let stats = self.encoder.stats();
        Ok(CaptureOutput {
            session_id: self.id,
            path,
            started_at: self.started_at,
            duration_ms: self.timeline.elapsed().as_secs_f64() * 1000.0,
            paused_ms: self.timeline.paused_total().as_secs_f64() * 1000.0,
            video_frames: stats.video.accepted,
            audio_frames: stats.audio.accepted,
            dropped_frames: stats.dropped,
            library_path: report.library_path,
        })
    }
}

pub struct CaptureSessionController {
    state: CaptureState,
    session: Option<CaptureSession>,
    /// Sessions discarded by reset whose finalize is still running
    detached: HashMap<SessionId, CaptureSession>,
    router: FrameRouter,
    callbacks: CallbackSink,
    writers: Arc<dyn WriterFactory>,
    config: EngineConfig,
    notifier: FinishNotifier,
    last_error: Option<CaptureError>,
}

impl CaptureSessionController {
    pub fn new(
        config: EngineConfig,
        writers: Arc<dyn WriterFactory>,
        callbacks: CallbackSink,
        notifier: FinishNotifier,
    ) -> Self {
        Self {
            state: CaptureState::Idle,
            session: None,
            detached: HashMap::new(),
            router: FrameRouter::new(callbacks.clone(), config.metadata_detection),
            callbacks,
            writers,
            config,
            notifier,
            last_error: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn router_mut(&mut self) -> &mut FrameRouter {
        &mut self.router
    }

    pub fn set_detector(&mut self, detector: Box<dyn CodeDetector>) {
        self.router.set_detector(detector);
    }

    pub fn set_face_detector(&mut self, detector: Box<dyn FaceDetector>) {
        self.router.set_face_detector(detector);
    }

    fn transition(&mut self, to: CaptureState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::debug!("Capture state {} -> {}", from, to);
        self.callbacks.send(CallbackEvent::StateChanged(StateChange {
            session_id: self.session_id(),
            from,
            to,
        }));
    }

    /// Start a new session writing to `path`.
    ///
    /// Errors are returned directly; `on_finished` is only kept once the
    /// session exists.
    pub fn start(
        &mut self,
        path: PathBuf,
        on_finished: Option<FinishedCallback>,
    ) -> CaptureResult<SessionId> {
        match self.state {
            CaptureState::Idle => {}
            CaptureState::Finished => {
                self.transition(CaptureState::Idle);
                self.session = None;
            }
            _ => return Err(CaptureError::AlreadyCapturing),
        }

        let (width, height) = self.config.encoder_preset.dimensions();
        let descriptor = OutputDescriptor::new(
            path,
            width,
            height,
            self.config.audio_channels,
            self.config.audio_sample_rate,
        )
        .with_frame_rate(self.config.frame_rate)
        .with_quality(self.config.quality);

        let encoder = StreamEncoder::create(
            descriptor,
            self.writers.as_ref(),
            self.config.encoder_options(),
        )?;

        let frame_interval = Timestamp::from_micros(1_000_000 / i64::from(self.config.frame_rate.max(1)));
        let session = CaptureSession {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            max_duration: self.config.max_duration(),
            timeline: Timeline::new(frame_interval),
            encoder,
            on_finished,
        };
        let id = session.id;

        tracing::info!(
            "Starting capture session {} to {}",
            id,
            session.encoder.descriptor().path().display()
        );

        self.session = Some(session);
        self.last_error = None;
        self.router.reset_codes();
        self.transition(CaptureState::Capturing);
        Ok(id)
    }

    pub fn pause(&mut self) -> CommandOutcome {
        if self.state != CaptureState::Capturing {
            tracing::debug!("Pause ignored in state {}", self.state);
            return CommandOutcome::Ignored(self.state);
        }
        tracing::info!("Capture paused");
        self.transition(CaptureState::Paused);
        CommandOutcome::Applied(self.state)
    }

    pub fn resume(&mut self) -> CommandOutcome {
        if self.state != CaptureState::Paused {
            tracing::debug!("Resume ignored in state {}", self.state);
            return CommandOutcome::Ignored(self.state);
        }
        if let Some(session) = self.session.as_mut() {
            session.timeline.resume();
        }
        tracing::info!("Capture resumed");
        self.transition(CaptureState::Capturing);
        CommandOutcome::Applied(self.state)
    }

    pub fn stop(&mut self) -> CommandOutcome {
        if !self.state.is_active() {
            tracing::debug!("Stop ignored in state {}", self.state);
            return CommandOutcome::Ignored(self.state);
        }
        tracing::info!("Stopping capture");
        self.begin_finishing();
        CommandOutcome::Applied(self.state)
    }

    /// Close the encoder and move to Finishing
    fn begin_finishing(&mut self) {
        self.transition(CaptureState::Finishing);
        if let Some(session) = self.session.as_ref() {
            self.finalize(session);
        }
    }

    fn finalize(&self, session: &CaptureSession) {
        let id = session.id;
        let notifier = self.notifier.clone();
        let library_dir = self.config.auto_save_dir();

        session.encoder.finish(move |outcome| {
            let library_path = match (&outcome, library_dir) {
                (Ok(path), Some(dir)) => match storage::save_to_library(path, &dir) {
                    Ok(saved) => Some(saved),
                    Err(e) => {
                        tracing::warn!("Auto-save of {} failed: {}", path.display(), e);
                        None
                    }
                },
                _ => None,
            };
            notifier(
                id,
                FinalizeReport {
                    outcome,
                    library_path,
                },
            );
        });
    }

    /// Apply a finalize outcome posted by the notifier
    pub fn on_finalized(&mut self, id: SessionId, report: FinalizeReport) {
        if let Some(mut session) = self.detached.remove(&id) {
            tracing::debug!("Detached session {} finalized", id);
            let result = session.output(report);
            if let Some(callback) = session.on_finished.take() {
                self.callbacks.send(CallbackEvent::Finished {
                    session_id: id,
                    callback,
                    result,
                });
            }
            return;
        }

        if self.state != CaptureState::Finishing || self.session_id() != Some(id) {
            tracing::warn!("Ignoring finalize of unknown session {}", id);
            return;
        }

        let Some(mut session) = self.session.take() else {
            return;
        };
        let result = session.output(report);
        match &result {
            Ok(output) => tracing::info!(
                "Capture session {} finished: {} ({:.0} ms)",
                id,
                output.path.display(),
                output.duration_ms
            ),
            Err(e) => {
                tracing::error!("Capture session {} failed: {}", id, e);
                self.last_error = Some(e.clone());
            }
        }

        let callback = session.on_finished.take();
        self.session = Some(session);
        self.transition(CaptureState::Finished);

        if let Some(callback) = callback {
            self.callbacks.send(CallbackEvent::Finished {
                session_id: id,
                callback,
                result,
            });
        }
    }

    /// Route one frame, encoding it when capturing
    pub fn on_frame(&mut self, frame: FrameBuffer) -> RouteReport {
        let session_id = self.session_id();

        if self.state == CaptureState::Capturing {
            if let Some(session) = self.session.as_mut() {
                let rebased = session.timeline.rebase(&frame);
                let elapsed = session.timeline.elapsed_at(rebased);

                if session.max_duration.is_some_and(|max| elapsed >= max) {
                    tracing::info!("Maximum capture duration reached at {:?}", elapsed);
                    self.begin_finishing();
                    let context = RouteContext {
                        session_id,
                        state: self.state,
                        elapsed,
                    };
                    return self.router.route(frame, None, context);
                }

                let context = RouteContext {
                    session_id,
                    state: self.state,
                    elapsed,
                };
                let target = EncodeTarget {
                    encoder: &session.encoder,
                    pts: rebased,
                };
                return self.router.route(frame, Some(target), context);
            }
        }

        let elapsed = self
            .session
            .as_ref()
            .map(|s| s.timeline.elapsed())
            .unwrap_or_default();
        let context = RouteContext {
            session_id,
            state: self.state,
            elapsed,
        };
        self.router.route(frame, None, context)
    }

    /// Serve `callback` from the next routed video frame
    pub fn capture_photo(&mut self, callback: PhotoCallback) {
        self.router.request_photo(callback);
    }

    /// Return to Idle. An active session is finalized best-effort and its
    /// finished callback still fires once.
    pub fn reset(&mut self) {
        if let Some(session) = self.session.take() {
            match self.state {
                CaptureState::Capturing | CaptureState::Paused => {
                    tracing::info!("Reset during capture, finalizing session {}", session.id);
                    self.finalize(&session);
                    self.detached.insert(session.id, session);
                }
                CaptureState::Finishing => {
                    self.detached.insert(session.id, session);
                }
                _ => {}
            }
        }
        self.transition(CaptureState::Idle);
    }

    pub fn set_device_position(&mut self, position: DevicePosition) -> CaptureResult<()> {
        if self.state.is_active() {
            return Err(CaptureError::DeviceBusy);
        }
        if self.config.device_position != position {
            tracing::info!("Camera position set to {:?}", position);
            self.config.device_position = position;
        }
        Ok(())
    }

    /// Replace the configuration. Encoding settings apply from the next
    /// session; detection mode applies immediately.
    pub fn update_config(&mut self, config: EngineConfig) -> CaptureResult<()> {
        config.validate()?;
        if self.state.is_active() && config.device_position != self.config.device_position {
            return Err(CaptureError::DeviceBusy);
        }
        self.router.set_detection_mode(config.metadata_detection);
        self.config = config;
        Ok(())
    }

    /// Reset and fail any pending photo requests
    pub fn shutdown(&mut self) {
        self.reset();
        self.router.cancel_photos(CaptureError::EngineStopped);
    }

    /// Sessions still finalizing after a reset
    pub fn pending_finalizes(&self) -> usize {
        self.detached.len()
    }

    pub fn stats(&self) -> ControllerStats {
        let session = self.session.as_ref();
        ControllerStats {
            state: self.state,
            session_id: session.map(|s| s.id),
            elapsed_ms: session
                .map(|s| s.timeline.elapsed().as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
            paused_ms: session
                .map(|s| s.timeline.paused_total().as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
            router: self.router.stats(),
            encoder: session.map(|s| s.encoder.stats()),
            last_error: self.last_error.clone().map(ErrorResponse::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::encoder::manifest::{Manifest, ManifestWriterFactory};
    use crate::encoder::writer::ContainerWriter;
    use crate::recorder::callbacks::spawn_dispatcher;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use tempfile::tempdir;

    struct Harness {
        controller: CaptureSessionController,
        finalized: mpsc::Receiver<(SessionId, FinalizeReport)>,
        sink: CallbackSink,
    }

    impl Harness {
        fn new(config: EngineConfig) -> Self {
            Self::with_writers(config, Arc::new(ManifestWriterFactory))
        }

        fn with_writers(config: EngineConfig, writers: Arc<dyn WriterFactory>) -> Self {
            let (sink, _handle) = spawn_dispatcher();
            let (tx, rx) = mpsc::channel();
            let tx = Mutex::new(tx);
            let notifier: FinishNotifier = Arc::new(move |id, report| {
                let _ = tx.lock().send((id, report));
            });
            Self {
                controller: CaptureSessionController::new(
                    config,
                    writers,
                    sink.clone(),
                    notifier,
                ),
                finalized: rx,
                sink,
            }
        }

        fn apply_finalized(&mut self) {
            let (id, report) = self
                .finalized
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            self.controller.on_finalized(id, report);
        }
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            encoder_preset: crate::encoder::descriptor::EncoderPreset::Vga,
            audio_channels: 1,
            audio_sample_rate: 8_000,
            ..EngineConfig::default()
        }
    }

    fn video(ms: i64) -> FrameBuffer {
        FrameBuffer::video(Timestamp::from_millis(ms), 1, 1, PixelFormat::Rgba, vec![0u8; 4])
    }

    fn finished_slot() -> (
        FinishedCallback,
        Arc<Mutex<Vec<CaptureResult<CaptureOutput>>>>,
    ) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let log = results.clone();
        let callback: FinishedCallback =
            Box::new(move |result: CaptureResult<CaptureOutput>| log.lock().push(result));
        (callback, results)
    }

    #[tokio::test]
    async fn test_start_while_capturing_fails() {
        let dir = tempdir().unwrap();
        let mut h = Harness::new(small_config());

        let id = h.controller.start(dir.path().join("a.json"), None).unwrap();
        let err = h.controller.start(dir.path().join("b.json"), None).unwrap_err();
        assert_eq!(err, CaptureError::AlreadyCapturing);
        assert_eq!(h.controller.session_id(), Some(id));
        assert_eq!(h.controller.state(), CaptureState::Capturing);
    }

    #[tokio::test]
    async fn test_commands_outside_their_states_are_ignored() {
        let mut h = Harness::new(small_config());
        assert_eq!(h.controller.pause(), CommandOutcome::Ignored(CaptureState::Idle));
        assert_eq!(h.controller.resume(), CommandOutcome::Ignored(CaptureState::Idle));
        assert_eq!(h.controller.stop(), CommandOutcome::Ignored(CaptureState::Idle));
    }

    #[tokio::test]
    async fn test_full_lifecycle_reports_output_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut h = Harness::new(small_config());

        let changes = Arc::new(Mutex::new(Vec::new()));
        let log = changes.clone();
        h.sink.send(CallbackEvent::SetStateCallback(Some(Box::new(
            move |change: StateChange| log.lock().push(change.to),
        ))));

        let (callback, results) = finished_slot();
        h.controller.start(path.clone(), Some(callback)).unwrap();
        for ms in [0, 40, 80] {
            assert!(h.controller.on_frame(video(ms)).encoded());
        }

        assert!(h.controller.pause().is_applied());
        assert!(!h.controller.on_frame(video(120)).encoded());
        assert!(h.controller.resume().is_applied());
        assert!(h.controller.on_frame(video(3_000)).encoded());

        assert_eq!(h.controller.stop(), CommandOutcome::Applied(CaptureState::Finishing));
        assert_eq!(h.controller.stop(), CommandOutcome::Ignored(CaptureState::Finishing));
        h.apply_finalized();
        assert_eq!(h.controller.state(), CaptureState::Finished);
        h.sink.flush().await;

        let results = results.lock();
        assert_eq!(results.len(), 1);
        let output = results[0].as_ref().unwrap();
        assert_eq!(output.path, path);
        assert_eq!(output.video_frames, 4);
        assert_eq!(output.duration_ms, 120.0);

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(
            manifest.offsets(crate::capture::frame::MediaKind::Video),
            vec![
                Timestamp::ZERO,
                Timestamp::from_millis(40),
                Timestamp::from_millis(80),
                Timestamp::from_millis(120)
            ]
        );

        assert_eq!(
            *changes.lock(),
            vec![
                CaptureState::Capturing,
                CaptureState::Paused,
                CaptureState::Capturing,
                CaptureState::Finishing,
                CaptureState::Finished
            ]
        );
    }

    #[tokio::test]
    async fn test_max_duration_stops_at_limit_frame() {
        let dir = tempdir().unwrap();
        let mut h = Harness::new(EngineConfig {
            maximum_capture_duration: Some(5.0),
            ..small_config()
        });
        h.controller.start(dir.path().join("max.json"), None).unwrap();

        let mut encoded = 0;
        for second in 0..=6 {
            let report = h.controller.on_frame(video(second * 1_000));
            if report.encoded() {
                encoded += 1;
            }
            if second == 5 {
                assert_eq!(h.controller.state(), CaptureState::Finishing);
            }
        }
        assert_eq!(encoded, 5);

        h.apply_finalized();
        assert_eq!(h.controller.state(), CaptureState::Finished);
    }

    #[tokio::test]
    async fn test_start_from_finished_passes_through_idle() {
        let dir = tempdir().unwrap();
        let mut h = Harness::new(small_config());

        h.controller.start(dir.path().join("one.json"), None).unwrap();
        h.controller.on_frame(video(0));
        h.controller.stop();
        h.apply_finalized();

        let second = h.controller.start(dir.path().join("two.json"), None).unwrap();
        assert_eq!(h.controller.session_id(), Some(second));
        assert_eq!(h.controller.state(), CaptureState::Capturing);
    }

    #[tokio::test]
    async fn test_reset_still_reports_finish_once() {
        let dir = tempdir().unwrap();
        let mut h = Harness::new(small_config());

        let (callback, results) = finished_slot();
        h.controller.start(dir.path().join("reset.json"), Some(callback)).unwrap();
        h.controller.on_frame(video(0));
        h.controller.reset();
        assert_eq!(h.controller.state(), CaptureState::Idle);
        assert_eq!(h.controller.pending_finalizes(), 1);

        h.apply_finalized();
        assert_eq!(h.controller.pending_finalizes(), 0);
        assert_eq!(h.controller.state(), CaptureState::Idle);
        h.sink.flush().await;
        assert_eq!(results.lock().len(), 1);
        assert!(results.lock()[0].is_ok());
    }

    #[tokio::test]
    async fn test_empty_session_reports_failure() {
        let dir = tempdir().unwrap();
        let mut h = Harness::new(small_config());

        let (callback, results) = finished_slot();
        h.controller.start(dir.path().join("empty.json"), Some(callback)).unwrap();
        h.controller.stop();
        h.apply_finalized();
        h.sink.flush().await;

        assert!(matches!(
            results.lock()[0],
            Err(CaptureError::FinalizeFailed(_))
        ));
        assert_eq!(
            h.controller.stats().last_error.map(|e| e.code),
            Some("FINALIZE_FAILED".to_string())
        );
    }

    /// Accepts every frame, then fails to close the container
    struct TrailerFailsWriter;

    impl ContainerWriter for TrailerFailsWriter {
        fn start_session(&mut self, _at: Timestamp) -> CaptureResult<()> {
            Ok(())
        }

        fn append(&mut self, _frame: &FrameBuffer) -> CaptureResult<()> {
            Ok(())
        }

        fn finish(self: Box<Self>) -> CaptureResult<PathBuf> {
            Err(CaptureError::Io("no space left on device".to_string()))
        }
    }

    #[tokio::test]
    async fn test_writer_finish_failure_ends_session() {
        let dir = tempdir().unwrap();
        let writers = |_: &OutputDescriptor| -> CaptureResult<Box<dyn ContainerWriter>> {
            Ok(Box::new(TrailerFailsWriter))
        };
        let mut h = Harness::with_writers(small_config(), Arc::new(writers));

        let (callback, results) = finished_slot();
        h.controller.start(dir.path().join("full.mp4"), Some(callback)).unwrap();
        for ms in [0, 33, 66] {
            assert!(h.controller.on_frame(video(ms)).encoded());
        }
        assert!(h.controller.stop().is_applied());
        assert_eq!(h.controller.state(), CaptureState::Finishing);
        h.apply_finalized();
        h.sink.flush().await;

        assert_eq!(h.controller.state(), CaptureState::Finished);
        let results = results.lock();
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(CaptureError::FinalizeFailed(message)) => assert!(message.contains("no space left")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let error = h.controller.stats().last_error.unwrap();
        assert_eq!(error.code, "FINALIZE_FAILED");
        // nothing else pending, no second report
        assert!(h.finalized.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn test_device_position_refused_while_capturing() {
        let dir = tempdir().unwrap();
        let mut h = Harness::new(small_config());

        h.controller.set_device_position(DevicePosition::Front).unwrap();
        h.controller.start(dir.path().join("d.json"), None).unwrap();
        assert_eq!(
            h.controller.set_device_position(DevicePosition::Back),
            Err(CaptureError::DeviceBusy)
        );

        let mut config = h.controller.config().clone();
        config.device_position = DevicePosition::Back;
        assert_eq!(h.controller.update_config(config), Err(CaptureError::DeviceBusy));
    }

    #[tokio::test]
    async fn test_auto_save_copies_into_library() {
        let dir = tempdir().unwrap();
        let library = dir.path().join("library");
        let mut h = Harness::new(EngineConfig {
            auto_save_video: true,
            library_dir: Some(library.clone()),
            ..small_config()
        });

        let (callback, results) = finished_slot();
        h.controller.start(dir.path().join("saved.json"), Some(callback)).unwrap();
        h.controller.on_frame(video(0));
        h.controller.stop();
        h.apply_finalized();
        h.sink.flush().await;

        let results = results.lock();
        let output = results[0].as_ref().unwrap();
        assert_eq!(output.library_path, Some(library.join("saved.json")));
        assert!(library.join("saved.json").exists());
    }
}
