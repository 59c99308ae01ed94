//! Timeline manifest writer
//!
//! Writes the accepted-frame timeline as JSON instead of media. Used for
//! dry runs and for checking session timing without FFmpeg.

use crate::capture::frame::{FrameBuffer, FrameFormat, MediaKind, Timestamp};
use crate::encoder::descriptor::OutputDescriptor;
use crate::encoder::writer::{ContainerWriter, WriterFactory};
use crate::utils::error::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One appended frame, relative to the session start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub kind: MediaKind,
    pub pts_us: i64,
    pub offset_us: i64,
    pub bytes: usize,
    pub format: FrameFormat,
}

/// The written manifest document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub output: OutputDescriptor,
    pub session_start_us: Option<i64>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Read a manifest back from disk
    pub fn load(path: &Path) -> CaptureResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Offsets of every entry of `kind`, in append order
    pub fn offsets(&self, kind: MediaKind) -> Vec<Timestamp> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| Timestamp::from_micros(e.offset_us))
            .collect()
    }

    /// Span from the session start to the last entry
    pub fn duration(&self) -> Timestamp {
        Timestamp::from_micros(self.entries.iter().map(|e| e.offset_us).max().unwrap_or(0))
    }
}

/// Opens [`ManifestWriter`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestWriterFactory;

impl WriterFactory for ManifestWriterFactory {
    fn open(&self, descriptor: &OutputDescriptor) -> CaptureResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(ManifestWriter::new(descriptor.clone())))
    }
}

pub struct ManifestWriter {
    manifest: Manifest,
}

impl ManifestWriter {
    pub fn new(descriptor: OutputDescriptor) -> Self {
        Self {
            manifest: Manifest {
                output: descriptor,
                session_start_us: None,
                entries: Vec::new(),
            },
        }
    }
}

impl ContainerWriter for ManifestWriter {
    fn start_session(&mut self, at: Timestamp) -> CaptureResult<()> {
        self.manifest.session_start_us = Some(at.as_micros());
        Ok(())
    }

    fn append(&mut self, frame: &FrameBuffer) -> CaptureResult<()> {
        let start = self
            .manifest
            .session_start_us
            .ok_or_else(|| CaptureError::WriterNotReady("session not started".to_string()))?;

        self.manifest.entries.push(ManifestEntry {
            kind: frame.kind(),
            pts_us: frame.pts().as_micros(),
            offset_us: frame.pts().as_micros() - start,
            bytes: frame.payload().len(),
            format: frame.format(),
        });
        Ok(())
    }

    fn finish(self: Box<Self>) -> CaptureResult<PathBuf> {
        let path = self.manifest.output.path().to_path_buf();
        let json = serde_json::to_string_pretty(&self.manifest)
            .map_err(|e| CaptureError::FinalizeFailed(e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| CaptureError::FinalizeFailed(format!("{}: {}", path.display(), e)))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use tempfile::tempdir;

    #[test]
    fn test_manifest_records_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("timeline.json");
        let mut writer = Box::new(ManifestWriter::new(OutputDescriptor::new(&path, 4, 4, 1, 8_000)));

        writer.start_session(Timestamp::from_millis(500)).unwrap();
        writer
            .append(&FrameBuffer::video(Timestamp::from_millis(500), 1, 1, PixelFormat::Rgba, vec![0u8; 4]))
            .unwrap();
        writer
            .append(&FrameBuffer::audio_from_samples(Timestamp::from_millis(520), 1, 8_000, &[0.0; 4]))
            .unwrap();

        let written = writer.finish().unwrap();
        let manifest = Manifest::load(&written).unwrap();

        assert_eq!(manifest.session_start_us, Some(500_000));
        assert_eq!(manifest.offsets(MediaKind::Video), vec![Timestamp::ZERO]);
        assert_eq!(manifest.offsets(MediaKind::Audio), vec![Timestamp::from_millis(20)]);
        assert_eq!(manifest.duration(), Timestamp::from_millis(20));
        assert_eq!(manifest.entries[1].bytes, 16);
    }

    #[test]
    fn test_append_before_session_fails() {
        let mut writer = ManifestWriter::new(OutputDescriptor::new("/tmp/x.json", 1, 1, 1, 1));
        let frame = FrameBuffer::video(Timestamp::ZERO, 1, 1, PixelFormat::Rgba, vec![0u8; 4]);
        assert!(matches!(writer.append(&frame), Err(CaptureError::WriterNotReady(_))));
    }
}
