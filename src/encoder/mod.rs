//! Encoding
//!
//! The stream encoder and the container writers behind it:
//! - `StreamEncoder` admits frames and serializes writer work on one thread
//! - `FfmpegWriter` muxes MP4 through the FFmpeg binary
//! - `ManifestWriter` records the timeline as JSON

pub mod descriptor;
pub mod ffmpeg;
pub mod manifest;
pub mod stream;
pub mod writer;

pub use descriptor::{EncodeQuality, EncoderPreset, OutputDescriptor};
pub use ffmpeg::{FfmpegWriter, FfmpegWriterFactory};
pub use manifest::{Manifest, ManifestWriter, ManifestWriterFactory};
pub use stream::{
    EncoderOptions, EncoderStats, EncoderTrack, FinishOutcome, SessionStartPolicy, StreamEncoder,
    WriterStatus,
};
pub use writer::{ContainerWriter, WriterFactory};
