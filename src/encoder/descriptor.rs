//! Output descriptor and encoding presets

use crate::utils::error::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Named output dimension presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncoderPreset {
    #[serde(rename = "640x480")]
    Vga,
    #[serde(rename = "960x540")]
    Qhd,
    #[serde(rename = "1280x720")]
    Hd720,
    #[default]
    #[serde(rename = "1920x1080")]
    Hd1080,
    #[serde(rename = "3840x2160")]
    Uhd,
}

impl EncoderPreset {
    /// Output (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            EncoderPreset::Vga => (640, 480),
            EncoderPreset::Qhd => (960, 540),
            EncoderPreset::Hd720 => (1280, 720),
            EncoderPreset::Hd1080 => (1920, 1080),
            EncoderPreset::Uhd => (3840, 2160),
        }
    }
}

/// Encode quality levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncodeQuality {
    Low,
    Medium,
    #[default]
    High,
    Lossless,
}

impl EncodeQuality {
    /// CRF value for H.264. Lower values = higher quality, larger files
    pub fn crf(&self) -> u8 {
        match self {
            EncodeQuality::Low => 28,
            EncodeQuality::Medium => 23,
            EncodeQuality::High => 18,
            // CRF 0 breaks yuv420p output in some players
            EncodeQuality::Lossless => 1,
        }
    }

    /// x264 preset. Capture favours speed over size.
    pub fn h264_preset(&self) -> &'static str {
        match self {
            EncodeQuality::Low => "ultrafast",
            EncodeQuality::Medium => "superfast",
            EncodeQuality::High => "veryfast",
            EncodeQuality::Lossless => "medium",
        }
    }
}

/// Where and how one capture session is written. Fixed at encoder creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDescriptor {
    path: PathBuf,
    width: u32,
    height: u32,
    channels: u16,
    sample_rate: u32,
    frame_rate: u32,
    overwrite: bool,
    quality: EncodeQuality,
}

impl OutputDescriptor {
    pub fn new(
        path: impl Into<PathBuf>,
        width: u32,
        height: u32,
        channels: u16,
        sample_rate: u32,
    ) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            channels,
            sample_rate,
            frame_rate: 30,
            overwrite: true,
            quality: EncodeQuality::default(),
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_quality(mut self, quality: EncodeQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn quality(&self) -> EncodeQuality {
        self.quality
    }

    /// Check the descriptor and prepare the destination directory.
    ///
    /// Fails if any dimension or rate is zero, or if the destination exists
    /// and cannot be replaced.
    pub fn validate(&self) -> CaptureResult<()> {
        let zero = [
            ("width", self.width == 0),
            ("height", self.height == 0),
            ("channels", self.channels == 0),
            ("sample rate", self.sample_rate == 0),
            ("frame rate", self.frame_rate == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(CaptureError::InvalidDescriptor(format!("{} must be positive", name)));
        }

        if self.path.as_os_str().is_empty() {
            return Err(CaptureError::InvalidDescriptor("empty output path".to_string()));
        }

        if let Ok(metadata) = std::fs::metadata(&self.path) {
            if metadata.is_dir() {
                return Err(CaptureError::InvalidDescriptor(format!(
                    "{} is a directory",
                    self.path.display()
                )));
            }
            if !self.overwrite {
                return Err(CaptureError::InvalidDescriptor(format!(
                    "{} already exists",
                    self.path.display()
                )));
            }
            if metadata.permissions().readonly() {
                return Err(CaptureError::InvalidDescriptor(format!(
                    "{} exists and is read-only",
                    self.path.display()
                )));
            }
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CaptureError::InvalidDescriptor(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }
}
