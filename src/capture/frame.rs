//! Frame model
//!
//! A `FrameBuffer` is created by a producer, handed by value to the router
//! and then fanned out to consumers. The payload is an immutable `Bytes`
//! so every consumer gets its own cheap handle to the same data.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Presentation timestamp in microseconds of media time. May be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1_000_000.0).round() as i64)
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(duration.as_micros().min(i64::MAX as u128) as i64)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Non-negative span as a `Duration`; negative spans clamp to zero.
    pub fn to_duration(self) -> Duration {
        Duration::from_micros(self.0.max(0) as u64)
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timestamp) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Timestamp) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// Media kind of a frame, one encoder track per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packed pixel layouts delivered by camera sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Rgb24,
    Yuyv422,
    Nv12,
}

impl PixelFormat {
    /// FFmpeg `-pixel_format` name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Yuyv422 => "yuyv422",
            PixelFormat::Nv12 => "nv12",
        }
    }

    /// Size in bytes of one frame at the given dimensions
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => pixels * 4,
            PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Yuyv422 => pixels * 2,
            PixelFormat::Nv12 => pixels * 3 / 2,
        }
    }
}

/// Layout of a frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FrameFormat {
    #[serde(rename_all = "camelCase")]
    Video {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    },
    /// Interleaved f32 little-endian samples
    #[serde(rename_all = "camelCase")]
    Audio { channels: u16, sample_rate: u32 },
}

impl FrameFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            FrameFormat::Video { .. } => MediaKind::Video,
            FrameFormat::Audio { .. } => MediaKind::Audio,
        }
    }
}

/// One captured video frame or audio buffer
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pts: Timestamp,
    format: FrameFormat,
    payload: Bytes,
}

impl FrameBuffer {
    pub fn new(pts: Timestamp, format: FrameFormat, payload: impl Into<Bytes>) -> Self {
        Self {
            pts,
            format,
            payload: payload.into(),
        }
    }

    pub fn video(
        pts: Timestamp,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(
            pts,
            FrameFormat::Video {
                width,
                height,
                pixel_format,
            },
            payload,
        )
    }

    pub fn audio(pts: Timestamp, channels: u16, sample_rate: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(
            pts,
            FrameFormat::Audio {
                channels,
                sample_rate,
            },
            payload,
        )
    }

    /// Build an audio frame from interleaved f32 samples
    pub fn audio_from_samples(pts: Timestamp, channels: u16, sample_rate: u32, samples: &[f32]) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::audio(pts, channels, sample_rate, bytes)
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    pub fn pts(&self) -> Timestamp {
        self.pts
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Same payload, new timestamp. Shares the underlying bytes.
    pub fn with_pts(&self, pts: Timestamp) -> Self {
        Self {
            pts,
            format: self.format,
            payload: self.payload.clone(),
        }
    }

    /// Video dimensions, if this is a video frame
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.format {
            FrameFormat::Video { width, height, .. } => Some((width, height)),
            FrameFormat::Audio { .. } => None,
        }
    }

    /// Number of sample frames (samples per channel) in an audio buffer
    pub fn sample_frames(&self) -> usize {
        match self.format {
            FrameFormat::Audio { channels, .. } if channels > 0 => {
                self.payload.len() / 4 / channels as usize
            }
            _ => 0,
        }
    }

    /// Playback length of an audio buffer; zero for video frames
    pub fn duration(&self) -> Timestamp {
        match self.format {
            FrameFormat::Audio { sample_rate, .. } if sample_rate > 0 => Timestamp::from_micros(
                (self.sample_frames() as i64 * 1_000_000) / sample_rate as i64,
            ),
            _ => Timestamp::ZERO,
        }
    }
}
