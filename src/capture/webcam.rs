//! Webcam capture using nokhwa
//!
//! Frames are pushed in the camera's native packed format. MJPEG cameras are
//! decoded to rgb24 on the capture thread.

use crate::capture::frame::{FrameBuffer, MediaKind, PixelFormat, Timestamp};
use crate::capture::traits::{CameraInfo, FrameSink, FrameSource, Resolution};
use crate::utils::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use nokhwa::pixel_format::{RgbAFormat, RgbFormat};
use nokhwa::utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Get list of available cameras
pub fn list_cameras() -> Vec<CameraInfo> {
    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) => cameras
            .into_iter()
            .map(|info| {
                let id = match info.index() {
                    CameraIndex::Index(i) => i.to_string(),
                    CameraIndex::String(s) => s.to_string(),
                };

                CameraInfo {
                    id,
                    name: info.human_name().to_string(),
                    supported_resolutions: vec![
                        Resolution { width: 1920, height: 1080 },
                        Resolution { width: 1280, height: 720 },
                        Resolution { width: 640, height: 480 },
                    ],
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate cameras: {:?}", e);
            Vec::new()
        }
    }
}

/// Map a nokhwa frame format to the packed layout we push downstream.
/// `None` means the frame must be decoded first.
fn native_pixel_format(format: FrameFormat) -> Option<PixelFormat> {
    match format {
        FrameFormat::YUYV => Some(PixelFormat::Yuyv422),
        FrameFormat::NV12 => Some(PixelFormat::Nv12),
        FrameFormat::RAWRGB => Some(PixelFormat::Rgb24),
        _ => None,
    }
}

/// Webcam frame source
pub struct WebcamSource {
    id: String,
    device_id: Option<String>,
    is_running: Arc<AtomicBool>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
}

impl WebcamSource {
    /// Create a source for `device_id` (None = first camera)
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            id: "webcam".to_string(),
            device_id,
            is_running: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
        }
    }

    fn camera_index(&self) -> CameraIndex {
        match &self.device_id {
            Some(id) => match id.parse::<u32>() {
                Ok(idx) => CameraIndex::Index(idx),
                Err(_) => CameraIndex::String(id.clone()),
            },
            None => CameraIndex::Index(0),
        }
    }
}

#[async_trait]
impl FrameSource for WebcamSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    async fn start(&mut self, sink: FrameSink) -> CaptureResult<()> {
        if list_cameras().is_empty() {
            return Err(CaptureError::Device("No cameras found".to_string()));
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::Device("Webcam already running".to_string()));
        }

        let camera_index = self.camera_index();
        let is_running = self.is_running.clone();

        let handle = std::thread::spawn(move || {
            let format =
                RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestResolution);

            let mut camera = match Camera::new(camera_index.clone(), format) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to open camera {:?}: {:?}", camera_index, e);
                    is_running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            if let Err(e) = camera.open_stream() {
                tracing::error!("Failed to open camera stream: {:?}", e);
                is_running.store(false, Ordering::SeqCst);
                return;
            }

            let camera_format = camera.camera_format();
            let width = camera_format.resolution().width();
            let height = camera_format.resolution().height();
            let frame_format = camera_format.format();
            let native = native_pixel_format(frame_format);

            tracing::info!(
                "Webcam opened: {}x{} @ {}fps, format={:?} -> {}",
                width,
                height,
                camera_format.frame_rate(),
                frame_format,
                native.map(|p| p.ffmpeg_name()).unwrap_or("decoded rgb24")
            );

            let mut frame_count: u64 = 0;

            while is_running.load(Ordering::SeqCst) && !sink.is_closed() {
                // Blocks until the camera delivers; the camera sets the pace
                let buffer = match camera.frame() {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        tracing::debug!("Failed to capture frame: {:?}", e);
                        continue;
                    }
                };
                let pts = sink.elapsed();

                let frame = match native {
                    Some(pixel_format) => FrameBuffer::video(
                        pts,
                        width,
                        height,
                        pixel_format,
                        buffer.buffer().to_vec(),
                    ),
                    None => match buffer.decode_image::<RgbFormat>() {
                        Ok(image) => FrameBuffer::video(
                            pts,
                            width,
                            height,
                            PixelFormat::Rgb24,
                            image.into_raw(),
                        ),
                        Err(e) => {
                            tracing::debug!("Failed to decode {:?} frame: {:?}", frame_format, e);
                            continue;
                        }
                    },
                };

                sink.push(frame);
                frame_count += 1;
            }

            let elapsed = capture_start.elapsed().as_secs_f64();
            tracing::info!(
                "Webcam captured {} frames in {:.2}s ({:.1} fps actual)",
                frame_count,
                elapsed,
                frame_count as f64 / elapsed.max(f64::EPSILON)
            );

            if let Err(e) = camera.stop_stream() {
                tracing::warn!("Error stopping camera stream: {:?}", e);
            }
        });

        self.capture_thread = Some(handle);
        tracing::info!("Webcam capture starting");
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        tracing::info!("Webcam capture stopped");
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
    fn test_native_pixel_formats() {
        assert_eq!(native_pixel_format(FrameFormat::YUYV), Some(PixelFormat::Yuyv422));
        assert_eq!(native_pixel_format(FrameFormat::NV12), Some(PixelFormat::Nv12));
        assert_eq!(native_pixel_format(FrameFormat::MJPEG), None);
    }
}
