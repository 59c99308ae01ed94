//! Camera engine
//!
//! [`CameraEngine`] is a cloneable handle to one producer task. The task owns
//! the [`CaptureSessionController`] and with it the router and the current
//! session. Commands reach it over an unbounded control channel that is
//! polled before frames; frames arrive through a bounded [`FrameSink`].
//! Finalize outcomes from encode workers come back on a third channel so the
//! Finishing -> Finished transition happens on the producer task.
//!
//! The engine has to be created from within a tokio runtime.

use crate::capture::frame::FrameBuffer;
use crate::capture::traits::FrameSink;
use crate::config::{DevicePosition, EngineConfig};
use crate::detect::{CodeDetector, DetectedCode, DetectedFace, FaceDetector};
use crate::encoder::ffmpeg::FfmpegWriterFactory;
use crate::encoder::writer::WriterFactory;
use crate::recorder::callbacks::{
    spawn_dispatcher, CallbackEvent, CallbackSink, FinishedCallback, PhotoCallback,
};
use crate::recorder::controller::{
    CaptureSessionController, ControllerStats, FinalizeReport, FinishNotifier,
};
use crate::recorder::photo::CapturedPhoto;
use crate::recorder::state::{
    CaptureOutput, CaptureState, CommandOutcome, ProgressReport, SessionId, StateChange,
};
use crate::utils::error::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Engine snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub controller: ControllerStats,
    /// Frames discarded because the frame queue was full
    pub frame_queue_dropped: u64,
}

enum Control {
    Start {
        path: PathBuf,
        on_finished: FinishedCallback,
        reply: oneshot::Sender<CaptureResult<SessionId>>,
    },
    Pause(oneshot::Sender<CommandOutcome>),
    Resume(oneshot::Sender<CommandOutcome>),
    Stop(oneshot::Sender<CommandOutcome>),
    Reset(oneshot::Sender<()>),
    Photo(PhotoCallback),
    CodeCallback(bool),
    FaceCallback(bool),
    ProgressCallback(bool),
    Detector(Box<dyn CodeDetector>),
    FaceDetector(Box<dyn FaceDetector>),
    State(oneshot::Sender<CaptureState>),
    Stats(oneshot::Sender<ControllerStats>),
    Config(oneshot::Sender<EngineConfig>),
    UpdateConfig(EngineConfig, oneshot::Sender<CaptureResult<()>>),
    DevicePosition(DevicePosition, oneshot::Sender<CaptureResult<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running capture engine
#[derive(Clone)]
pub struct CameraEngine {
    control: mpsc::UnboundedSender<Control>,
    callbacks: CallbackSink,
    frames: FrameSink,
}

impl CameraEngine {
    /// Start an engine writing through `writers`
    pub fn new(config: EngineConfig, writers: Arc<dyn WriterFactory>) -> CaptureResult<Self> {
        config.validate()?;

        let (callbacks, _dispatcher) = spawn_dispatcher();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (finalized_tx, finalized_rx) = mpsc::unbounded_channel();
        let (frames, frames_rx) = FrameSink::channel(config.frame_queue_depth);

        let notifier: FinishNotifier = Arc::new(move |id, report| {
            if finalized_tx.send((id, report)).is_err() {
                tracing::warn!("Engine gone before session {} finalized", id);
            }
        });

        let controller =
            CaptureSessionController::new(config, writers, callbacks.clone(), notifier);
        tokio::spawn(run_producer(
            controller,
            callbacks.clone(),
            control_rx,
            finalized_rx,
            frames_rx,
        ));

        tracing::info!("Camera engine started");
        Ok(Self {
            control: control_tx,
            callbacks,
            frames,
        })
    }

    /// Start an engine that muxes MP4 through the ffmpeg binary
    pub fn with_ffmpeg(config: EngineConfig) -> CaptureResult<Self> {
        let writers = FfmpegWriterFactory::new();
        writers.check_available()?;
        Self::new(config, Arc::new(writers))
    }

    /// Sink for frame sources to push into
    pub fn frame_sink(&self) -> FrameSink {
        self.frames.clone()
    }

    /// Offer one frame without blocking. Returns false if it was dropped.
    pub fn push_frame(&self, frame: FrameBuffer) -> bool {
        self.frames.push(frame)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> CaptureResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| CaptureError::EngineStopped)
    }

    fn send(&self, control: Control) -> CaptureResult<()> {
        self.control
            .send(control)
            .map_err(|_| CaptureError::EngineStopped)
    }

    /// Start a session writing to `path`. `on_finished` fires exactly once
    /// when the session's output is finalized or has failed.
    pub async fn start_capture<F>(
        &self,
        path: impl Into<PathBuf>,
        on_finished: F,
    ) -> CaptureResult<SessionId>
    where
        F: FnOnce(CaptureResult<CaptureOutput>) + Send + 'static,
    {
        let path = path.into();
        self.request(|reply| Control::Start {
            path,
            on_finished: Box::new(on_finished),
            reply,
        })
        .await?
    }

    pub async fn pause_capture(&self) -> CaptureResult<CommandOutcome> {
        self.request(Control::Pause).await
    }

    pub async fn resume_capture(&self) -> CaptureResult<CommandOutcome> {
        self.request(Control::Resume).await
    }

    pub async fn stop_capture(&self) -> CaptureResult<CommandOutcome> {
        self.request(Control::Stop).await
    }

    pub async fn reset(&self) -> CaptureResult<()> {
        self.request(Control::Reset).await
    }

    /// Take a PNG snapshot of the next video frame
    pub fn capture_photo<F>(&self, on_captured: F) -> CaptureResult<()>
    where
        F: FnOnce(CaptureResult<CapturedPhoto>) + Send + 'static,
    {
        self.send(Control::Photo(Box::new(on_captured)))
    }

    /// [`Self::capture_photo`], awaiting the result
    pub async fn take_photo(&self) -> CaptureResult<CapturedPhoto> {
        let (tx, rx) = oneshot::channel();
        self.capture_photo(move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| CaptureError::EngineStopped)?
    }

    pub fn on_code_detected<F>(&self, callback: F) -> CaptureResult<()>
    where
        F: FnMut(DetectedCode) + Send + 'static,
    {
        // registration is queued ahead of any code the router reports
        self.callbacks
            .send(CallbackEvent::SetCodeCallback(Some(Box::new(callback))));
        self.send(Control::CodeCallback(true))
    }

    /// Called for every face found while the detection mode is `Face`
    pub fn on_face_detected<F>(&self, callback: F) -> CaptureResult<()>
    where
        F: FnMut(DetectedFace) + Send + 'static,
    {
        self.callbacks
            .send(CallbackEvent::SetFaceCallback(Some(Box::new(callback))));
        self.send(Control::FaceCallback(true))
    }

    pub fn on_progress<F>(&self, callback: F) -> CaptureResult<()>
    where
        F: FnMut(ProgressReport) + Send + 'static,
    {
        self.callbacks
            .send(CallbackEvent::SetProgressCallback(Some(Box::new(callback))));
        self.send(Control::ProgressCallback(true))
    }

    pub fn on_state_changed<F>(&self, callback: F) -> CaptureResult<()>
    where
        F: FnMut(StateChange) + Send + 'static,
    {
        self.callbacks
            .send(CallbackEvent::SetStateCallback(Some(Box::new(callback))));
        Ok(())
    }

    /// Unregister the code, face, progress and state callbacks
    pub fn clear_callbacks(&self) -> CaptureResult<()> {
        self.send(Control::CodeCallback(false))?;
        self.send(Control::FaceCallback(false))?;
        self.send(Control::ProgressCallback(false))?;
        self.callbacks.send(CallbackEvent::SetCodeCallback(None));
        self.callbacks.send(CallbackEvent::SetFaceCallback(None));
        self.callbacks.send(CallbackEvent::SetProgressCallback(None));
        self.callbacks.send(CallbackEvent::SetStateCallback(None));
        Ok(())
    }

    /// Install the per-frame code decoder
    pub fn set_detector(&self, detector: impl CodeDetector + 'static) -> CaptureResult<()> {
        self.send(Control::Detector(Box::new(detector)))
    }

    /// Install the per-frame face finder
    pub fn set_face_detector(&self, detector: impl FaceDetector + 'static) -> CaptureResult<()> {
        self.send(Control::FaceDetector(Box::new(detector)))
    }

    pub async fn state(&self) -> CaptureResult<CaptureState> {
        self.request(Control::State).await
    }

    pub async fn stats(&self) -> CaptureResult<EngineStats> {
        let controller = self.request(Control::Stats).await?;
        Ok(EngineStats {
            controller,
            frame_queue_dropped: self.frames.dropped(),
        })
    }

    pub async fn config(&self) -> CaptureResult<EngineConfig> {
        self.request(Control::Config).await
    }

    pub async fn update_config(&self, config: EngineConfig) -> CaptureResult<()> {
        self.request(|reply| Control::UpdateConfig(config, reply))
            .await?
    }

    pub async fn set_device_position(&self, position: DevicePosition) -> CaptureResult<()> {
        self.request(|reply| Control::DevicePosition(position, reply))
            .await?
    }

    /// Stop the engine. Resolves once every pending finalize has completed
    /// and its finished callback has been delivered.
    pub async fn shutdown(&self) -> CaptureResult<()> {
        self.request(Control::Shutdown).await
    }

    /// Wait until every callback queued so far has run
    pub async fn flush_callbacks(&self) {
        self.callbacks.flush().await;
    }
}

async fn run_producer(
    mut controller: CaptureSessionController,
    callbacks: CallbackSink,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut finalized: mpsc::UnboundedReceiver<(SessionId, FinalizeReport)>,
    mut frames: mpsc::Receiver<FrameBuffer>,
) {
    let mut frames_open = true;
    let mut shutdown_reply = None;

    loop {
        tokio::select! {
            biased;

            message = control.recv() => match message {
                Some(Control::Shutdown(reply)) => {
                    shutdown_reply = Some(reply);
                    break;
                }
                Some(message) => handle_control(&mut controller, message),
                None => {
                    tracing::debug!("All engine handles dropped");
                    break;
                }
            },

            Some((id, report)) = finalized.recv() => controller.on_finalized(id, report),

            frame = frames.recv(), if frames_open => match frame {
                Some(frame) => {
                    controller.on_frame(frame);
                }
                None => frames_open = false,
            },
        }
    }

    tracing::info!("Shutting down camera engine");
    controller.shutdown();

    while controller.pending_finalizes() > 0 {
        match finalized.recv().await {
            Some((id, report)) => controller.on_finalized(id, report),
            None => break,
        }
    }

    callbacks.flush().await;
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
    tracing::info!("Camera engine stopped");
}

fn handle_control(controller: &mut CaptureSessionController, message: Control) {
    match message {
        Control::Start {
            path,
            on_finished,
            reply,
        } => {
            let _ = reply.send(controller.start(path, Some(on_finished)));
        }
        Control::Pause(reply) => {
            let _ = reply.send(controller.pause());
        }
        Control::Resume(reply) => {
            let _ = reply.send(controller.resume());
        }
        Control::Stop(reply) => {
            let _ = reply.send(controller.stop());
        }
        Control::Reset(reply) => {
            controller.reset();
            let _ = reply.send(());
        }
        Control::Photo(callback) => controller.capture_photo(callback),
        Control::CodeCallback(registered) => controller.router_mut().set_code_callback(registered),
        Control::FaceCallback(registered) => controller.router_mut().set_face_callback(registered),
        Control::ProgressCallback(registered) => {
            controller.router_mut().set_progress_callback(registered)
        }
        Control::Detector(detector) => controller.set_detector(detector),
        Control::FaceDetector(detector) => controller.set_face_detector(detector),
        Control::State(reply) => {
            let _ = reply.send(controller.state());
        }
        Control::Stats(reply) => {
            let _ = reply.send(controller.stats());
        }
        Control::Config(reply) => {
            let _ = reply.send(controller.config().clone());
        }
        Control::UpdateConfig(config, reply) => {
            let _ = reply.send(controller.update_config(config));
        }
        Control::DevicePosition(position, reply) => {
            let _ = reply.send(controller.set_device_position(position));
        }
        Control::Shutdown(reply) => {
            // handled by the producer loop
            let _ = reply.send(());
        }
    }
}
