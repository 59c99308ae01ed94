//! Callback context
//!
//! Every user-facing callback runs on one dispatcher task, in the order its
//! event was queued, never concurrently with another callback. Registrations
//! travel through the same queue as events, so a callback only sees events
//! queued after it was registered.

use crate::detect::{DetectedCode, DetectedFace};
use crate::recorder::photo::CapturedPhoto;
use crate::recorder::state::{CaptureOutput, ProgressReport, SessionId, StateChange};
use crate::utils::error::CaptureResult;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub type StateCallback = Box<dyn FnMut(StateChange) + Send>;
pub type CodeCallback = Box<dyn FnMut(DetectedCode) + Send>;
pub type FaceCallback = Box<dyn FnMut(DetectedFace) + Send>;
pub type ProgressCallback = Box<dyn FnMut(ProgressReport) + Send>;
pub type FinishedCallback = Box<dyn FnOnce(CaptureResult<CaptureOutput>) + Send>;
pub type PhotoCallback = Box<dyn FnOnce(CaptureResult<CapturedPhoto>) + Send>;

/// Work for the callback context
pub enum CallbackEvent {
    SetStateCallback(Option<StateCallback>),
    SetCodeCallback(Option<CodeCallback>),
    SetFaceCallback(Option<FaceCallback>),
    SetProgressCallback(Option<ProgressCallback>),
    StateChanged(StateChange),
    CodeDetected(DetectedCode),
    FaceDetected(DetectedFace),
    Progress(ProgressReport),
    Finished {
        session_id: SessionId,
        callback: FinishedCallback,
        result: CaptureResult<CaptureOutput>,
    },
    Photo {
        callback: PhotoCallback,
        result: CaptureResult<CapturedPhoto>,
    },
    /// Resolves once every earlier event has been delivered
    Flush(oneshot::Sender<()>),
}

/// Sending side of the callback context
#[derive(Clone)]
pub struct CallbackSink {
    tx: mpsc::UnboundedSender<CallbackEvent>,
}

impl CallbackSink {
    pub fn send(&self, event: CallbackEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Callback context closed, event discarded");
        }
    }

    /// Wait until every event queued so far has been delivered
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(CallbackEvent::Flush(tx));
        let _ = rx.await;
    }
}

#[derive(Default)]
struct Registrations {
    state: Option<StateCallback>,
    code: Option<CodeCallback>,
    face: Option<FaceCallback>,
    progress: Option<ProgressCallback>,
}

/// Start the dispatcher task. It runs until every sink is dropped.
pub fn spawn_dispatcher() -> (CallbackSink, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_dispatcher(rx));
    (CallbackSink { tx }, handle)
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<CallbackEvent>) {
    let mut callbacks = Registrations::default();

    while let Some(event) = rx.recv().await {
        match event {
            CallbackEvent::SetStateCallback(cb) => callbacks.state = cb,
            CallbackEvent::SetCodeCallback(cb) => callbacks.code = cb,
            CallbackEvent::SetFaceCallback(cb) => callbacks.face = cb,
            CallbackEvent::SetProgressCallback(cb) => callbacks.progress = cb,
            CallbackEvent::StateChanged(change) => {
                if let Some(cb) = callbacks.state.as_mut() {
                    cb(change);
                }
            }
            CallbackEvent::CodeDetected(code) => {
                if let Some(cb) = callbacks.code.as_mut() {
                    cb(code);
                }
            }
            CallbackEvent::FaceDetected(face) => {
                if let Some(cb) = callbacks.face.as_mut() {
                    cb(face);
                }
            }
            CallbackEvent::Progress(report) => {
                if let Some(cb) = callbacks.progress.as_mut() {
                    cb(report);
                }
            }
            CallbackEvent::Finished {
                session_id,
                callback,
                result,
            } => {
                tracing::debug!("Delivering finish of session {}", session_id);
                callback(result);
            }
            CallbackEvent::Photo { callback, result } => callback(result),
            CallbackEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!("Callback context stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::state::CaptureState;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn change(to: CaptureState) -> StateChange {
        StateChange {
            session_id: None,
            from: CaptureState::Idle,
            to,
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order_after_registration() {
        let (sink, _handle) = spawn_dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // queued before registration, never delivered
        sink.send(CallbackEvent::StateChanged(change(CaptureState::Paused)));

        let log = seen.clone();
        sink.send(CallbackEvent::SetStateCallback(Some(Box::new(move |c: StateChange| {
            log.lock().push(c.to)
        }))));
        sink.send(CallbackEvent::StateChanged(change(CaptureState::Capturing)));
        sink.send(CallbackEvent::StateChanged(change(CaptureState::Finishing)));
        sink.flush().await;

        assert_eq!(
            *seen.lock(),
            vec![CaptureState::Capturing, CaptureState::Finishing]
        );
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let (sink, _handle) = spawn_dispatcher();
        let count = Arc::new(Mutex::new(0));

        let counter = count.clone();
        sink.send(CallbackEvent::SetCodeCallback(Some(Box::new(move |_: DetectedCode| {
            *counter.lock() += 1
        }))));
        sink.send(CallbackEvent::CodeDetected(DetectedCode::qr("a")));
        sink.send(CallbackEvent::SetCodeCallback(None));
        sink.send(CallbackEvent::CodeDetected(DetectedCode::qr("b")));
        sink.flush().await;

        assert_eq!(*count.lock(), 1);
    }
}
