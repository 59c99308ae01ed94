//! Engine configuration
//!
//! Camera, session and encoding settings, stored as camelCase JSON.

use crate::detect::DetectionMode;
use crate::encoder::descriptor::{EncodeQuality, EncoderPreset};
use crate::encoder::stream::{EncoderOptions, SessionStartPolicy};
use crate::utils::error::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which camera to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePosition {
    Front,
    #[default]
    Back,
}

/// Capture engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Flash for photos
    pub flash: bool,

    /// Continuous torch
    pub torch: bool,

    pub device_position: DevicePosition,

    /// Stop automatically after this many seconds of active capture
    /// (None = unbounded)
    pub maximum_capture_duration: Option<f64>,

    /// Copy every finished capture into `library_dir`
    pub auto_save_video: bool,

    /// Auto-save destination (None = default library directory)
    pub library_dir: Option<PathBuf>,

    /// Output dimensions
    pub encoder_preset: EncoderPreset,

    pub quality: EncodeQuality,

    /// Output frame rate
    pub frame_rate: u32,

    pub audio_channels: u16,

    pub audio_sample_rate: u32,

    /// Which codes are reported to the code callback
    pub metadata_detection: DetectionMode,

    pub session_start_policy: SessionStartPolicy,

    /// Frames admitted to the encoder but not yet written
    pub encode_queue_depth: usize,

    /// Frames pushed by sources but not yet routed
    pub frame_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flash: false,
            torch: false,
            device_position: DevicePosition::Back,
            maximum_capture_duration: None,
            auto_save_video: false,
            library_dir: None,
            encoder_preset: EncoderPreset::Hd1080,
            quality: EncodeQuality::High,
            frame_rate: 30,
            audio_channels: 2,
            audio_sample_rate: 44_100,
            metadata_detection: DetectionMode::QrCode,
            session_start_policy: SessionStartPolicy::AnyTrack,
            encode_queue_depth: 64,
            frame_queue_depth: 32,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> CaptureResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save(&self, path: &Path) -> CaptureResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.frame_rate == 0 {
            return Err(CaptureError::Config("frameRate must be positive".to_string()));
        }
        if self.encode_queue_depth == 0 || self.frame_queue_depth == 0 {
            return Err(CaptureError::Config("queue depths must be positive".to_string()));
        }
        if let Some(secs) = self.maximum_capture_duration {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(CaptureError::Config(format!(
                    "maximumCaptureDuration must be a positive number of seconds, got {}",
                    secs
                )));
            }
            if let Err(e) = Duration::try_from_secs_f64(secs) {
                return Err(CaptureError::Config(format!(
                    "maximumCaptureDuration {} is out of range: {}",
                    secs, e
                )));
            }
        }
        Ok(())
    }

    /// Maximum active capture time, if bounded
    pub fn max_duration(&self) -> Option<Duration> {
        self.maximum_capture_duration
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn encoder_options(&self) -> EncoderOptions {
        EncoderOptions {
            queue_depth: self.encode_queue_depth,
            session_start: self.session_start_policy,
        }
    }

    /// Auto-save destination, if auto-save is on
    pub fn auto_save_dir(&self) -> Option<PathBuf> {
        if !self.auto_save_video {
            return None;
        }
        Some(
            self.library_dir
                .clone()
                .unwrap_or_else(crate::storage::default_library_dir),
        )
    }
}
