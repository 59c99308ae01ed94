//! Capture coordination
//!
//! This module implements the capture-side pipeline:
//! - CaptureSessionController owning the state machine and session
//! - FrameRouter fanning frames out to encoder, detector, progress and photos
//! - Timeline re-basing timestamps across pauses
//! - Callback context delivering user callbacks serially

pub mod callbacks;
pub mod controller;
pub mod photo;
pub mod router;
pub mod state;
pub mod timeline;

pub use callbacks::{spawn_dispatcher, CallbackEvent, CallbackSink};
pub use controller::{CaptureSessionController, ControllerStats, FinalizeReport, FinishNotifier};
pub use photo::CapturedPhoto;
pub use router::{FrameRouter, RouteReport, RouterStats};
pub use state::{CaptureOutput, CaptureState, CommandOutcome, ProgressReport, SessionId, StateChange};
pub use timeline::Timeline;
