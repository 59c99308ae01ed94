//! Capture state management
//!
//! Defines the capture state machine and the values reported to callers.

use crate::capture::frame::FrameBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Identifies one capture session
pub type SessionId = Uuid;

/// Current state of the capture session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    /// No session
    #[default]
    Idle,
    /// Frames are encoded
    Capturing,
    /// Frames bypass the encoder; detection and progress continue
    Paused,
    /// Encoder closed, finalize in progress
    Finishing,
    /// Finalize completed (successfully or not)
    Finished,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Capturing => "capturing",
            CaptureState::Paused => "paused",
            CaptureState::Finishing => "finishing",
            CaptureState::Finished => "finished",
        }
    }

    /// Capturing or paused: a session owns the camera
    pub fn is_active(&self) -> bool {
        matches!(self, CaptureState::Capturing | CaptureState::Paused)
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a control command that is allowed to be a no-op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "state")]
pub enum CommandOutcome {
    /// The command moved the controller into this state
    Applied(CaptureState),
    /// The command did not apply in this state
    Ignored(CaptureState),
}

impl CommandOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommandOutcome::Applied(_))
    }

    pub fn state(&self) -> CaptureState {
        match self {
            CommandOutcome::Applied(state) | CommandOutcome::Ignored(state) => *state,
        }
    }
}

/// One observed state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub session_id: Option<SessionId>,
    pub from: CaptureState,
    pub to: CaptureState,
}

/// A finished capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOutput {
    pub session_id: SessionId,

    /// Location of the finished container
    pub path: PathBuf,

    /// Unix timestamp when the session started
    pub started_at: DateTime<Utc>,

    /// Active (non-paused) media time in milliseconds
    pub duration_ms: f64,

    /// Total time removed by pauses in milliseconds
    pub paused_ms: f64,

    pub video_frames: u64,
    pub audio_frames: u64,

    /// Frames refused by a saturated encoder
    pub dropped_frames: u64,

    /// Copy made when auto-save is enabled
    pub library_path: Option<PathBuf>,
}

/// Progress delivered for every routed frame
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub session_id: Option<SessionId>,
    pub state: CaptureState,

    /// Active capture time so far, excluding pauses
    pub elapsed: Duration,

    pub frame: FrameBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&CaptureState::Finishing).unwrap(),
            "\"finishing\""
        );
        assert_eq!(CaptureState::default(), CaptureState::Idle);
        assert!(CaptureState::Paused.is_active());
        assert!(!CaptureState::Finishing.is_active());
    }

    #[test]
    fn test_command_outcome() {
        let outcome = CommandOutcome::Ignored(CaptureState::Idle);
        assert!(!outcome.is_applied());
        assert_eq!(outcome.state(), CaptureState::Idle);
        assert_eq!(
            serde_json::to_string(&CommandOutcome::Applied(CaptureState::Paused)).unwrap(),
            r#"{"outcome":"applied","state":"paused"}"#
        );
    }
}
