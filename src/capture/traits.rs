//! Capture trait definitions
//!
//! Platform-agnostic traits for frame producers and the sink they push into.

use crate::capture::frame::{FrameBuffer, MediaKind, Timestamp};
use crate::utils::error::CaptureResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Information about a camera/webcam
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Supported resolutions
    pub supported_resolutions: Vec<Resolution>,
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Producer-side handle into the engine's frame queue
///
/// `push` never blocks. When the queue is full the frame is discarded and
/// counted, so a slow consumer cannot stall the capture thread.
///
/// Every clone shares one capture epoch. Sources stamp frames with
/// [`FrameSink::elapsed`] so tracks opened at different times stay aligned.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<FrameBuffer>,
    dropped: Arc<AtomicU64>,
    epoch: Instant,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<FrameBuffer>, dropped: Arc<AtomicU64>) -> Self {
        Self {
            tx,
            dropped,
            epoch: Instant::now(),
        }
    }

    /// Instant that media time zero refers to
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Media time now, on the shared capture clock
    pub fn elapsed(&self) -> Timestamp {
        Timestamp::from_duration(self.epoch.elapsed())
    }

    /// Create a sink and its receiving end with the given queue depth
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<FrameBuffer>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self::new(tx, Arc::new(AtomicU64::new(0))), rx)
    }

    /// Hand a frame to the engine. Returns false if it was dropped.
    pub fn push(&self, frame: FrameBuffer) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(
                    "Frame queue full, dropped {} frame at {} ({} total)",
                    frame.kind(),
                    frame.pts(),
                    dropped
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the engine side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Frames discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A hardware or synthetic frame producer
///
/// Sources deliver frames serially from their own thread into a
/// [`FrameSink`]. They never see session state.
#[async_trait]
pub trait FrameSource: Send {
    /// Source identifier
    fn id(&self) -> &str;

    /// Kind of frames this source produces
    fn kind(&self) -> MediaKind;

    /// Begin producing frames into `sink`
    async fn start(&mut self, sink: FrameSink) -> CaptureResult<()>;

    /// Stop producing and release the device
    async fn stop(&mut self) -> CaptureResult<()>;

    /// Whether the source is currently producing
    fn is_running(&self) -> bool;
}
