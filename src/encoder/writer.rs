//! Container writer seam
//!
//! A `ContainerWriter` is only ever driven from one encode worker thread,
//! so implementations need `Send` but no internal locking.

use crate::capture::frame::{FrameBuffer, Timestamp};
use crate::encoder::descriptor::OutputDescriptor;
use crate::utils::error::CaptureResult;
use std::path::PathBuf;

/// Muxes accepted frames into one output container
pub trait ContainerWriter: Send {
    /// Establish t=0 of the output at `at`. Called once, before any append.
    fn start_session(&mut self, at: Timestamp) -> CaptureResult<()>;

    /// Append one frame. Timestamps are non-decreasing per media kind and
    /// never earlier than the session start.
    fn append(&mut self, frame: &FrameBuffer) -> CaptureResult<()>;

    /// Close the container and return its final location
    fn finish(self: Box<Self>) -> CaptureResult<PathBuf>;
}

/// Opens a writer for a validated descriptor
pub trait WriterFactory: Send + Sync {
    fn open(&self, descriptor: &OutputDescriptor) -> CaptureResult<Box<dyn ContainerWriter>>;
}

impl<F> WriterFactory for F
where
    F: Fn(&OutputDescriptor) -> CaptureResult<Box<dyn ContainerWriter>> + Send + Sync,
{
    fn open(&self, descriptor: &OutputDescriptor) -> CaptureResult<Box<dyn ContainerWriter>> {
        self(descriptor)
    }
}
