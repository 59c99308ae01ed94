//! Synthetic capture sources
//!
//! A moving-bar test pattern and a sine tone, paced in real time on their own
//! threads. Used by the CLI when no camera is wanted and by integration tests.

use crate::capture::frame::{FrameBuffer, MediaKind, PixelFormat, Timestamp};
use crate::capture::traits::{FrameSink, FrameSource};
use crate::utils::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Render one RGBA test-pattern frame: a gradient with a bar that moves
/// one step per frame.
pub fn render_pattern(width: u32, height: u32, index: u64) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(PixelFormat::Rgba.frame_size(width, height));
    let bar_width = (width / 16).max(1);
    let bar_x = ((index * bar_width as u64) % width.max(1) as u64) as u32;

    for y in 0..height {
        for x in 0..width {
            if x >= bar_x && x < bar_x + bar_width {
                pixels.extend_from_slice(&[255, 255, 255, 255]);
            } else {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                pixels.extend_from_slice(&[r, g, 96, 255]);
            }
        }
    }
    pixels
}

/// Sleep until `deadline` or until `running` is cleared
fn wait_until(deadline: Instant, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}

/// Video source producing [`render_pattern`] frames at a fixed rate
pub struct TestPatternSource {
    id: String,
    width: u32,
    height: u32,
    fps: u32,
    is_running: Arc<AtomicBool>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            id: "test-pattern".to_string(),
            width,
            height,
            fps,
            is_running: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
        }
    }
}

#[async_trait]
impl FrameSource for TestPatternSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    async fn start(&mut self, sink: FrameSink) -> CaptureResult<()> {
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            return Err(CaptureError::Config(format!(
                "Test pattern needs non-zero size and rate, got {}x{} @ {}fps",
                self.width, self.height, self.fps
            )));
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::Device("Test pattern already running".to_string()));
        }

        let is_running = self.is_running.clone();
        let (width, height, fps) = (self.width, self.height, self.fps);

        // first frame is stamped when the source starts, on the sink's clock
        let origin = sink.elapsed();

        let handle = std::thread::spawn(move || {
            let epoch = sink.epoch();
            let mut index: u64 = 0;

            while is_running.load(Ordering::Relaxed) && !sink.is_closed() {
                let pts = origin + Timestamp::from_micros(index as i64 * 1_000_000 / fps as i64);
                wait_until(epoch + pts.to_duration(), &is_running);
                if !is_running.load(Ordering::Relaxed) {
                    break;
                }

                let frame = FrameBuffer::video(
                    pts,
                    width,
                    height,
                    PixelFormat::Rgba,
                    render_pattern(width, height, index),
                );
                sink.push(frame);
                index += 1;
            }

            tracing::info!("Test pattern stopped after {} frames", index);
        });

        self.capture_thread = Some(handle);
        tracing::info!("Test pattern started: {}x{} @ {}fps", width, height, fps);
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// Audio source producing a sine tone in fixed-size buffers
pub struct ToneSource {
    id: String,
    frequency: f32,
    channels: u16,
    sample_rate: u32,
    buffer_ms: u32,
    is_running: Arc<AtomicBool>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
}

impl ToneSource {
    pub fn new(frequency: f32, channels: u16, sample_rate: u32) -> Self {
        Self {
            id: "tone".to_string(),
            frequency,
            channels,
            sample_rate,
            buffer_ms: 20,
            is_running: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
        }
    }
}

#[async_trait]
impl FrameSource for ToneSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    async fn start(&mut self, sink: FrameSink) -> CaptureResult<()> {
        if self.channels == 0 || self.sample_rate == 0 {
            return Err(CaptureError::Config(
                "Tone source needs non-zero channels and sample rate".to_string(),
            ));
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::Device("Tone source already running".to_string()));
        }

        let is_running = self.is_running.clone();
        let (frequency, channels, sample_rate) = (self.frequency, self.channels, self.sample_rate);
        let frames_per_buffer = (sample_rate * self.buffer_ms / 1000).max(1) as u64;

        let origin = sink.elapsed();

        let handle = std::thread::spawn(move || {
            let epoch = sink.epoch();
            let mut position: u64 = 0;

            while is_running.load(Ordering::Relaxed) && !sink.is_closed() {
                let pts = origin
                    + Timestamp::from_micros((position * 1_000_000 / sample_rate as u64) as i64);
                wait_until(epoch + pts.to_duration(), &is_running);
                if !is_running.load(Ordering::Relaxed) {
                    break;
                }

                let mut samples = Vec::with_capacity(frames_per_buffer as usize * channels as usize);
                for i in 0..frames_per_buffer {
                    let t = (position + i) as f32 / sample_rate as f32;
                    let value = (t * frequency * std::f32::consts::TAU).sin() * 0.25;
                    for _ in 0..channels {
                        samples.push(value);
                    }
                }
                sink.push(FrameBuffer::audio_from_samples(pts, channels, sample_rate, &samples));
                position += frames_per_buffer;
            }
        });

        self.capture_thread = Some(handle);
        tracing::info!("Tone source started: {}Hz, {}ch @ {}Hz", frequency, channels, sample_rate);
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_size_and_bar() {
        let frame = render_pattern(32, 4, 1);
        assert_eq!(frame.len(), 32 * 4 * 4);
        // bar is 2px wide, at x=2 for index 1
        assert_eq!(&frame[8..12], &[255, 255, 255, 255]);
        assert_ne!(&frame[0..4], &[255, 255, 255, 255]);
    }

    #[tokio::test]
    async fn test_pattern_source_produces_ordered_frames() {
        let (sink, mut rx) = FrameSink::channel(64);
        let mut source = TestPatternSource::new(8, 8, 100);
        source.start(sink).await.unwrap();
        assert!(source.is_running());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        source.stop().await.unwrap();

        assert!(first.pts() >= Timestamp::ZERO);
        assert_eq!(second.pts() - first.pts(), Timestamp::from_millis(10));
        assert_eq!(first.dimensions(), Some((8, 8)));
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn test_sources_started_apart_share_one_clock() {
        let (sink, mut rx) = FrameSink::channel(256);
        let mut pattern = TestPatternSource::new(4, 4, 50);
        pattern.start(sink.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut tone = ToneSource::new(440.0, 1, 8_000);
        tone.start(sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tone.stop().await.unwrap();
        pattern.stop().await.unwrap();

        let mut first_audio = None;
        let mut last_video = None;
        while let Ok(frame) = rx.try_recv() {
            match frame.kind() {
                MediaKind::Audio => {
                    first_audio.get_or_insert(frame.pts());
                }
                MediaKind::Video => last_video = Some(frame.pts()),
            }
        }

        let first_audio = first_audio.unwrap();
        let last_video = last_video.unwrap();
        // the tone opened 300ms after the pattern and is stamped that way
        assert!(first_audio >= Timestamp::from_millis(300));
        assert!(last_video >= first_audio);
        assert!(last_video - first_audio < Timestamp::from_millis(200));
    }

    #[tokio::test]
    async fn test_tone_source_rejects_zero_rate() {
        let (sink, _rx) = FrameSink::channel(4);
        let mut source = ToneSource::new(440.0, 2, 0);
        assert!(matches!(source.start(sink).await, Err(CaptureError::Config(_))));
    }
}
