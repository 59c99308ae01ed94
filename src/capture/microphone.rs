//! Microphone capture using cpal
//!
//! The cpal stream is not `Send`, so it lives on a dedicated thread that is
//! kept alive while the source runs.

use crate::capture::frame::{FrameBuffer, MediaKind, Timestamp};
use crate::capture::traits::{FrameSink, FrameSource};
use crate::utils::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name, channel count and sample rate of the default input device
pub fn default_input_format() -> CaptureResult<(String, u16, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::Device("No default input device".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let config = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(format!("Failed to get audio config: {}", e)))?;
    if config.sample_format() != SampleFormat::F32 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "Input sample format {:?}, expected f32",
            config.sample_format()
        )));
    }

    Ok((name, config.channels(), config.sample_rate().0))
}

/// Default-microphone frame source
pub struct MicrophoneSource {
    id: String,
    is_running: Arc<AtomicBool>,
    stream_thread: Option<std::thread::JoinHandle<()>>,
}

impl MicrophoneSource {
    pub fn new() -> Self {
        Self {
            id: "microphone".to_string(),
            is_running: Arc::new(AtomicBool::new(false)),
            stream_thread: None,
        }
    }
}

impl Default for MicrophoneSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSource for MicrophoneSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    async fn start(&mut self, sink: FrameSink) -> CaptureResult<()> {
        let (device_name, channels, sample_rate) = default_input_format()?;
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::Device("Microphone already running".to_string()));
        }

        let is_running = self.is_running.clone();

        let handle = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_input_device() {
                Some(d) => d,
                None => {
                    tracing::error!("Default input device disappeared");
                    is_running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let stream_config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let is_rec = is_running.clone();
            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if is_rec.load(Ordering::Relaxed) {
                        // stamp the first sample of the buffer, not its delivery
                        let frames = data.len() as i64 / channels.max(1) as i64;
                        let span = Timestamp::from_micros(frames * 1_000_000 / sample_rate.max(1) as i64);
                        let pts = sink.elapsed() - span;
                        sink.push(FrameBuffer::audio_from_samples(pts, channels, sample_rate, data));
                    }
                },
                |err| tracing::error!("Microphone stream error: {}", err),
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to build input stream: {}", e);
                    is_running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            if let Err(e) = stream.play() {
                tracing::error!("Failed to start input stream: {}", e);
                is_running.store(false, Ordering::SeqCst);
                return;
            }

            while is_running.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }

            tracing::info!("Microphone stream stopped");
        });

        self.stream_thread = Some(handle);
        tracing::info!(
            "Microphone capture started: {} ({}Hz, {}ch)",
            device_name,
            sample_rate,
            channels
        );
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}
