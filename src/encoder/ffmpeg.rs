//! FFmpeg container writer
//!
//! Video is piped raw into a live FFmpeg process as it arrives and encoded
//! to H.264 during capture. Audio is small, so it is spooled as raw f32
//! samples and muxed in on finish with the encoded video stream copied.
//! Video is laid onto a constant-rate grid derived from the presentation
//! timestamps, so variable camera timing and pause re-basing survive into
//! the output. Audio gaps larger than the drift tolerance are filled with
//! silence.

use crate::capture::frame::{FrameBuffer, FrameFormat, PixelFormat, Timestamp};
use crate::encoder::descriptor::OutputDescriptor;
use crate::encoder::writer::{ContainerWriter, WriterFactory};
use crate::utils::error::{CaptureError, CaptureResult};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tempfile::TempDir;

/// Audio drift tolerated before padding or trimming, in microseconds
const AUDIO_DRIFT_TOLERANCE_US: i64 = 20_000;

const VIDEO_TRACK: &str = "video.mp4";
const VIDEO_LOG: &str = "video.log";
const AUDIO_SPOOL: &str = "audio.f32le";

/// Creates [`FfmpegWriter`]s using the given FFmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegWriterFactory {
    binary: PathBuf,
}

impl FfmpegWriterFactory {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Check that the FFmpeg binary can be run
    pub fn check_available(&self) -> CaptureResult<()> {
        match Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(CaptureError::Config(format!(
                "{} -version exited with {}",
                self.binary.display(),
                status
            ))),
            Err(e) => Err(CaptureError::Config(format!(
                "FFmpeg not found ({}). Please install FFmpeg and make sure it is on PATH",
                e
            ))),
        }
    }
}

impl Default for FfmpegWriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn open(&self, descriptor: &OutputDescriptor) -> CaptureResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(FfmpegWriter::create(descriptor.clone(), self.binary.clone())?))
    }
}

/// Raw video input layout, fixed by the first appended frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VideoInput {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// Raw audio input layout, fixed by the first appended buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AudioInput {
    channels: u16,
    sample_rate: u32,
}

/// Constant-rate slot filler. Holds the previous frame across gaps and
/// collapses frames that land in an already filled slot.
#[derive(Default)]
struct VideoGrid {
    /// Grid slots already filled
    slots: i64,
    last_frame: Option<Bytes>,
}

impl VideoGrid {
    /// Write `payload` into `slot`. Returns false if the slot was taken.
    fn place(&mut self, out: &mut impl Write, slot: i64, payload: &Bytes) -> std::io::Result<bool> {
        if slot < self.slots {
            return Ok(false);
        }

        // before the first frame there is nothing to hold, so it fills the gap
        let filler = self.last_frame.clone().unwrap_or_else(|| payload.clone());
        while self.slots < slot {
            out.write_all(&filler)?;
            self.slots += 1;
        }

        out.write_all(payload)?;
        self.slots += 1;
        self.last_frame = Some(payload.clone());
        Ok(true)
    }

    /// Repeat the last frame until `slot`
    fn hold_until(&mut self, out: &mut impl Write, slot: i64) -> std::io::Result<()> {
        let Some(last) = self.last_frame.clone() else {
            return Ok(());
        };
        while self.slots < slot {
            out.write_all(&last)?;
            self.slots += 1;
        }
        Ok(())
    }
}

/// Live H.264 encode of the video track, fed raw frames on stdin
struct VideoEncoder {
    input: VideoInput,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    grid: VideoGrid,
    log_path: PathBuf,
}

impl VideoEncoder {
    fn spawn(
        binary: &Path,
        descriptor: &OutputDescriptor,
        input: VideoInput,
        spool_dir: &Path,
    ) -> CaptureResult<Self> {
        let log_path = spool_dir.join(VIDEO_LOG);
        let log = File::create(&log_path)?;
        let args = build_video_args(descriptor, &input, &spool_dir.join(VIDEO_TRACK));

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| CaptureError::WriterNotReady(format!("Failed to start FFmpeg: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::WriterNotReady("FFmpeg stdin unavailable".to_string()))?;

        tracing::info!(
            "Started FFmpeg video encoder: {}x{} {} @ {}fps -> {}x{}",
            input.width,
            input.height,
            input.pixel_format.ffmpeg_name(),
            descriptor.frame_rate(),
            descriptor.width(),
            descriptor.height()
        );

        Ok(Self {
            input,
            child,
            stdin: Some(BufWriter::new(stdin)),
            grid: VideoGrid::default(),
            log_path,
        })
    }

    fn stdin(&mut self) -> CaptureResult<&mut BufWriter<ChildStdin>> {
        self.stdin
            .as_mut()
            .ok_or_else(|| CaptureError::WriterNotReady("video encoder already closed".to_string()))
    }

    fn place(&mut self, slot: i64, payload: &Bytes) -> CaptureResult<bool> {
        let Self { stdin, grid, .. } = self;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| CaptureError::WriterNotReady("video encoder already closed".to_string()))?;
        grid.place(stdin, slot, payload)
            .map_err(|e| CaptureError::Io(format!("FFmpeg video pipe: {}", e)))
    }

    fn hold_until(&mut self, slot: i64) -> CaptureResult<()> {
        let Self { stdin, grid, .. } = self;
        match stdin.as_mut() {
            Some(stdin) => grid
                .hold_until(stdin, slot)
                .map_err(|e| CaptureError::Io(format!("FFmpeg video pipe: {}", e))),
            None => Ok(()),
        }
    }

    /// Close stdin and wait for the encode to complete
    fn close(&mut self) -> CaptureResult<()> {
        let flushed = self.stdin()?.flush();
        drop(self.stdin.take());

        let status = self
            .child
            .wait()
            .map_err(|e| CaptureError::FinalizeFailed(format!("FFmpeg video encoder: {}", e)))?;
        if let Err(e) = flushed {
            return Err(CaptureError::FinalizeFailed(format!(
                "FFmpeg video pipe closed early: {}: {}",
                e,
                self.log()
            )));
        }
        if !status.success() {
            let log = self.log();
            tracing::warn!("FFmpeg video encoder exited with status {}: {}", status, log);
            return Err(CaptureError::FinalizeFailed(format!(
                "FFmpeg video encoder exited with status {}: {}",
                status, log
            )));
        }

        tracing::debug!("FFmpeg video encoder finished: {} slots", self.grid.slots);
        Ok(())
    }

    fn log(&self) -> String {
        std::fs::read_to_string(&self.log_path)
            .map(|log| log.trim().to_string())
            .unwrap_or_default()
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        // abandoned mid-session: stop the encode instead of letting it finish
        if self.stdin.is_some() {
            let _ = self.child.kill();
            drop(self.stdin.take());
            let _ = self.child.wait();
        }
    }
}

struct AudioSpool {
    input: AudioInput,
    file: BufWriter<File>,
    /// Sample frames (per channel) already written
    position: i64,
}

/// Streaming MP4 writer driven by the stream encoder's worker thread
pub struct FfmpegWriter {
    descriptor: OutputDescriptor,
    binary: PathBuf,
    spool_dir: TempDir,
    session_start: Option<Timestamp>,
    video: Option<VideoEncoder>,
    audio: Option<AudioSpool>,
}

impl FfmpegWriter {
    pub fn create(descriptor: OutputDescriptor, binary: PathBuf) -> CaptureResult<Self> {
        let spool_dir = tempfile::Builder::new()
            .prefix("camera-engine-")
            .tempdir()?;

        tracing::debug!(
            "FFmpeg writer working in {} for {}",
            spool_dir.path().display(),
            descriptor.path().display()
        );

        Ok(Self {
            descriptor,
            binary,
            spool_dir,
            session_start: None,
            video: None,
            audio: None,
        })
    }

    fn append_video(&mut self, frame: &FrameBuffer, start: Timestamp) -> CaptureResult<()> {
        let FrameFormat::Video {
            width,
            height,
            pixel_format,
        } = frame.format()
        else {
            return Ok(());
        };
        let input = VideoInput {
            width,
            height,
            pixel_format,
        };

        let expected = pixel_format.frame_size(width, height);
        if frame.payload().len() != expected {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} frame of {} bytes, expected {}",
                pixel_format.ffmpeg_name(),
                frame.payload().len(),
                expected
            )));
        }

        if self.video.is_none() {
            self.video = Some(VideoEncoder::spawn(
                &self.binary,
                &self.descriptor,
                input,
                self.spool_dir.path(),
            )?);
        }
        let Some(video) = self.video.as_mut() else {
            return Ok(());
        };

        if video.input != input {
            return Err(CaptureError::UnsupportedFormat(format!(
                "video input changed mid-session from {:?} to {:?}",
                video.input, input
            )));
        }

        let slot = video_slot(frame.pts(), start, self.descriptor.frame_rate());
        video.place(slot, frame.payload())?;
        Ok(())
    }

    fn append_audio(&mut self, frame: &FrameBuffer, start: Timestamp) -> CaptureResult<()> {
        let FrameFormat::Audio {
            channels,
            sample_rate,
        } = frame.format()
        else {
            return Ok(());
        };
        let input = AudioInput {
            channels,
            sample_rate,
        };
        if channels == 0 || sample_rate == 0 {
            return Err(CaptureError::UnsupportedFormat(
                "audio buffer with zero channels or sample rate".to_string(),
            ));
        }

        if self.audio.is_none() {
            let file = File::create(self.spool_dir.path().join(AUDIO_SPOOL))?;
            self.audio = Some(AudioSpool {
                input,
                file: BufWriter::new(file),
                position: 0,
            });
        }
        let Some(spool) = self.audio.as_mut() else {
            return Ok(());
        };

        if spool.input != input {
            return Err(CaptureError::UnsupportedFormat(format!(
                "audio input changed mid-session from {:?} to {:?}",
                spool.input, input
            )));
        }

        let bytes_per_frame = 4 * channels as usize;
        let target = (frame.pts() - start).as_micros() * sample_rate as i64 / 1_000_000;
        let tolerance = AUDIO_DRIFT_TOLERANCE_US * sample_rate as i64 / 1_000_000;
        let mut payload: &[u8] = frame.payload();

        if target > spool.position + tolerance {
            let silence = (target - spool.position) as usize * bytes_per_frame;
            spool.file.write_all(&vec![0u8; silence])?;
            spool.position = target;
        } else if target + tolerance < spool.position {
            let overlap = (spool.position - target) as usize * bytes_per_frame;
            if overlap >= payload.len() {
                return Ok(());
            }
            payload = &payload[overlap..];
        }

        let whole = payload.len() - payload.len() % bytes_per_frame;
        spool.file.write_all(&payload[..whole])?;
        spool.position += (whole / bytes_per_frame) as i64;
        Ok(())
    }
}

impl ContainerWriter for FfmpegWriter {
    fn start_session(&mut self, at: Timestamp) -> CaptureResult<()> {
        self.session_start = Some(at);
        Ok(())
    }

    fn append(&mut self, frame: &FrameBuffer) -> CaptureResult<()> {
        let start = self
            .session_start
            .ok_or_else(|| CaptureError::WriterNotReady("session not started".to_string()))?;
        match frame.format() {
            FrameFormat::Video { .. } => self.append_video(frame, start),
            FrameFormat::Audio { .. } => self.append_audio(frame, start),
        }
    }

    fn finish(mut self: Box<Self>) -> CaptureResult<PathBuf> {
        let fps = self.descriptor.frame_rate() as i64;

        let audio_input = match self.audio.as_mut() {
            Some(spool) => {
                spool
                    .file
                    .flush()
                    .map_err(|e| CaptureError::FinalizeFailed(e.to_string()))?;
                Some((spool.input, spool.position))
            }
            None => None,
        };

        let mut video_slots = 0;
        if let Some(video) = self.video.as_mut() {
            // Hold the last video frame until the audio ends
            if let Some((input, position)) = audio_input {
                if let Err(e) = video.hold_until(position * fps / input.sample_rate.max(1) as i64) {
                    tracing::debug!("Could not hold last frame: {}", e);
                }
            }
            video.close()?;
            video_slots = video.grid.slots;
        }
        let video_track = self
            .video
            .as_ref()
            .map(|_| self.spool_dir.path().join(VIDEO_TRACK));

        if video_track.is_none() && audio_input.is_none() {
            return Err(CaptureError::FinalizeFailed("nothing was captured".to_string()));
        }

        let args = build_mux_args(
            &self.descriptor,
            video_track.as_deref(),
            audio_input.map(|(input, _)| input).as_ref(),
            self.spool_dir.path(),
        );

        tracing::info!(
            "Muxing {} ({} video slots, {} audio frames)",
            self.descriptor.path().display(),
            video_slots,
            audio_input.map(|(_, position)| position).unwrap_or(0)
        );

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| CaptureError::FinalizeFailed(format!("Failed to start FFmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!("FFmpeg exited with status {}: {}", output.status, stderr);
            return Err(CaptureError::FinalizeFailed(format!(
                "FFmpeg exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let path = self.descriptor.path().to_path_buf();
        if !path.exists() {
            return Err(CaptureError::FinalizeFailed(format!(
                "FFmpeg reported success but {} is missing",
                path.display()
            )));
        }
        Ok(path)
    }
}

/// Constant-rate grid slot for a timestamp relative to the session start
fn video_slot(pts: Timestamp, start: Timestamp, fps: u32) -> i64 {
    let offset = (pts - start).as_micros().max(0) as i128;
    ((offset * fps as i128 + 500_000) / 1_000_000) as i64
}

/// Scale to the output size while keeping aspect ratio, padding with black
fn scale_filter(width: u32, height: u32) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black",
        w = width,
        h = height
    )
}

fn log_args() -> Vec<String> {
    vec!["-y".into(), "-hide_banner".into(), "-loglevel".into(), "error".into()]
}

/// Raw frames on stdin to an H.264 track at `encoded`
fn build_video_args(descriptor: &OutputDescriptor, video: &VideoInput, encoded: &Path) -> Vec<String> {
    let fps = descriptor.frame_rate();
    let quality = descriptor.quality();
    let mut args = log_args();

    args.extend([
        "-f".into(),
        "rawvideo".into(),
        "-pixel_format".into(),
        video.pixel_format.ffmpeg_name().into(),
        "-video_size".into(),
        format!("{}x{}", video.width, video.height),
        "-framerate".into(),
        fps.to_string(),
        "-i".into(),
        "-".into(),
    ]);
    if video.width != descriptor.width() || video.height != descriptor.height() {
        args.extend(["-vf".into(), scale_filter(descriptor.width(), descriptor.height())]);
    }
    args.extend([
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        quality.h264_preset().into(),
        "-crf".into(),
        quality.crf().to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-g".into(),
        (fps * 2).to_string(),
        encoded.to_string_lossy().to_string(),
    ]);
    args
}

/// Copy the encoded video track and encode the spooled audio into the output
fn build_mux_args(
    descriptor: &OutputDescriptor,
    video: Option<&Path>,
    audio: Option<&AudioInput>,
    spool_dir: &Path,
) -> Vec<String> {
    let mut args = log_args();

    if let Some(video) = video {
        args.extend(["-i".into(), video.to_string_lossy().to_string()]);
    }
    if let Some(audio) = audio {
        args.extend([
            "-f".into(),
            "f32le".into(),
            "-ar".into(),
            audio.sample_rate.to_string(),
            "-ac".into(),
            audio.channels.to_string(),
            "-i".into(),
            spool_dir.join(AUDIO_SPOOL).to_string_lossy().to_string(),
        ]);
    }

    if video.is_some() && audio.is_some() {
        args.extend(["-map".into(), "0:v:0".into(), "-map".into(), "1:a:0".into()]);
    }
    if video.is_some() {
        args.extend(["-c:v".into(), "copy".into()]);
    }
    if audio.is_some() {
        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "192k".into(),
            "-ac".into(),
            descriptor.channels().to_string(),
            "-ar".into(),
            descriptor.sample_rate().to_string(),
        ]);
    }

    args.extend([
        "-movflags".into(),
        "+faststart".into(),
        descriptor.path().to_string_lossy().to_string(),
    ]);
    args
}
