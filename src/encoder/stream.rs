//! Stream encoder
//!
//! Wraps a [`ContainerWriter`] behind a dedicated encode worker. Admission
//! checks and enqueueing happen under one lock, so the job queue order is
//! the acceptance order and a finish request lands behind every frame that
//! was already admitted. All writer I/O happens on the worker thread.

use crate::capture::frame::{FrameBuffer, MediaKind, Timestamp};
use crate::encoder::descriptor::OutputDescriptor;
use crate::encoder::writer::{ContainerWriter, WriterFactory};
use crate::utils::error::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

/// Result handed to every finish completion
pub type FinishOutcome = Result<PathBuf, CaptureError>;

type Completion = Box<dyn FnOnce(FinishOutcome) + Send>;

/// Which frame may open the writer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionStartPolicy {
    /// The first accepted frame of either kind sets t=0
    #[default]
    AnyTrack,
    /// Audio is refused until a video frame has set t=0
    VideoFirst,
}

/// Encoder tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderOptions {
    /// Frames admitted but not yet written before new frames are dropped
    pub queue_depth: usize,
    pub session_start: SessionStartPolicy,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            session_start: SessionStartPolicy::AnyTrack,
        }
    }
}

/// Overall writer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterStatus {
    /// Created, no frame accepted yet
    Unknown,
    Writing,
    Finishing,
    Completed,
    Failed,
}

impl WriterStatus {
    /// Whether new frames can still be admitted
    pub fn is_accepting(&self) -> bool {
        matches!(self, WriterStatus::Unknown | WriterStatus::Writing)
    }
}

/// Per-track bookkeeping
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderTrack {
    pub session_started: bool,
    pub last_written: Option<Timestamp>,
    pub accepted: u64,
}

/// Snapshot of encoder counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderStats {
    pub status: WriterStatus,
    pub session_start: Option<Timestamp>,
    pub video: EncoderTrack,
    pub audio: EncoderTrack,
    /// Frames refused because the encode queue was saturated
    pub dropped: u64,
    /// Frames the writer failed to append
    pub append_errors: u64,
}

enum Job {
    Start(Timestamp),
    Append(FrameBuffer),
    Finish,
}

struct Shared {
    status: WriterStatus,
    session_start: Option<Timestamp>,
    tracks: [EncoderTrack; 2],
    in_flight: usize,
    dropped: u64,
    append_errors: u64,
    jobs: Option<mpsc::Sender<Job>>,
    waiters: Vec<Completion>,
    outcome: Option<FinishOutcome>,
}

/// Serializes frame appends and the final finalize for one output file
pub struct StreamEncoder {
    descriptor: OutputDescriptor,
    options: EncoderOptions,
    shared: Arc<Mutex<Shared>>,
}

impl StreamEncoder {
    /// Validate `descriptor`, open a writer and start the encode worker
    pub fn create(
        descriptor: OutputDescriptor,
        writers: &dyn WriterFactory,
        options: EncoderOptions,
    ) -> CaptureResult<Self> {
        descriptor.validate()?;
        let writer = writers.open(&descriptor)?;

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Mutex::new(Shared {
            status: WriterStatus::Unknown,
            session_start: None,
            tracks: [EncoderTrack::default(); 2],
            in_flight: 0,
            dropped: 0,
            append_errors: 0,
            jobs: Some(tx),
            waiters: Vec::new(),
            outcome: None,
        }));

        let worker_shared = shared.clone();
        let label = descriptor.path().display().to_string();
        std::thread::Builder::new()
            .name("stream-encoder".to_string())
            .spawn(move || run_worker(writer, rx, worker_shared, label))?;

        tracing::info!(
            "Stream encoder created: {} ({}x{}, {}ch @ {}Hz, {}fps)",
            descriptor.path().display(),
            descriptor.width(),
            descriptor.height(),
            descriptor.channels(),
            descriptor.sample_rate(),
            descriptor.frame_rate()
        );

        Ok(Self {
            descriptor,
            options,
            shared,
        })
    }

    pub fn descriptor(&self) -> &OutputDescriptor {
        &self.descriptor
    }

    /// Offer a frame. Returns whether it was accepted.
    pub fn encode_frame(&self, frame: FrameBuffer) -> bool {
        match self.try_encode_frame(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!("Frame not accepted: {}", e);
                false
            }
        }
    }

    /// Offer a frame, reporting why it was refused
    pub fn try_encode_frame(&self, frame: FrameBuffer) -> CaptureResult<()> {
        let kind = frame.kind();
        let pts = frame.pts();
        let mut shared = self.shared.lock();

        if !shared.status.is_accepting() {
            return Err(CaptureError::WriterNotReady(format!(
                "writer is {:?}",
                shared.status
            )));
        }

        let starts_session = shared.session_start.is_none();
        if starts_session
            && kind == MediaKind::Audio
            && self.options.session_start == SessionStartPolicy::VideoFirst
        {
            return Err(CaptureError::WriterNotReady(
                "waiting for the first video frame".to_string(),
            ));
        }

        let track = shared.tracks[kind.index()];
        let floor = track.last_written.or(shared.session_start);
        if let Some(last) = floor {
            if pts < last {
                return Err(CaptureError::OutOfOrderFrame {
                    track: kind,
                    last,
                    got: pts,
                });
            }
        }

        if shared.in_flight >= self.options.queue_depth {
            shared.dropped += 1;
            return Err(CaptureError::FrameDropped);
        }

        let Some(jobs) = shared.jobs.clone() else {
            return Err(CaptureError::WriterNotReady("encoder is closed".to_string()));
        };

        if starts_session {
            if jobs.send(Job::Start(pts)).is_err() {
                return Err(CaptureError::WriterNotReady("encode worker stopped".to_string()));
            }
            shared.session_start = Some(pts);
            shared.status = WriterStatus::Writing;
            tracing::debug!("Writer session started at {} by {} frame", pts, kind);
        }

        if jobs.send(Job::Append(frame)).is_err() {
            return Err(CaptureError::WriterNotReady("encode worker stopped".to_string()));
        }

        let track = &mut shared.tracks[kind.index()];
        track.session_started = true;
        track.last_written = Some(pts);
        track.accepted += 1;
        shared.in_flight += 1;
        Ok(())
    }

    /// Close to new frames, drain admitted frames and finalize.
    ///
    /// `completion` runs exactly once. Calls made while finalizing attach to
    /// the pending outcome; calls made afterwards receive the stored outcome
    /// immediately on the calling thread.
    pub fn finish<F>(&self, completion: F)
    where
        F: FnOnce(FinishOutcome) + Send + 'static,
    {
        let mut shared = self.shared.lock();

        if let Some(outcome) = shared.outcome.clone() {
            drop(shared);
            completion(outcome);
            return;
        }

        shared.waiters.push(Box::new(completion));
        if shared.status == WriterStatus::Finishing {
            tracing::debug!("Finish already in progress, attached to pending outcome");
            return;
        }

        shared.status = WriterStatus::Finishing;
        let sent = shared
            .jobs
            .take()
            .map(|jobs| jobs.send(Job::Finish).is_ok())
            .unwrap_or(false);
        drop(shared);

        if !sent {
            complete(
                &self.shared,
                Err(CaptureError::FinalizeFailed("encode worker stopped".to_string())),
            );
        }
    }

    pub fn status(&self) -> WriterStatus {
        self.shared.lock().status
    }

    pub fn stats(&self) -> EncoderStats {
        let shared = self.shared.lock();
        EncoderStats {
            status: shared.status,
            session_start: shared.session_start,
            video: shared.tracks[MediaKind::Video.index()],
            audio: shared.tracks[MediaKind::Audio.index()],
            dropped: shared.dropped,
            append_errors: shared.append_errors,
        }
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        if shared.outcome.is_none() && shared.status != WriterStatus::Finishing {
            tracing::warn!(
                "Stream encoder for {} dropped without finish, finalizing",
                self.descriptor.path().display()
            );
            shared.status = WriterStatus::Finishing;
            if let Some(jobs) = shared.jobs.take() {
                let _ = jobs.send(Job::Finish);
            }
        }
    }
}

/// Store the outcome and run every attached completion outside the lock
fn complete(shared: &Mutex<Shared>, outcome: FinishOutcome) {
    let waiters = {
        let mut shared = shared.lock();
        if shared.outcome.is_some() {
            return;
        }
        shared.status = if outcome.is_ok() {
            WriterStatus::Completed
        } else {
            WriterStatus::Failed
        };
        shared.outcome = Some(outcome.clone());
        shared.jobs = None;
        std::mem::take(&mut shared.waiters)
    };

    for waiter in waiters {
        waiter(outcome.clone());
    }
}

fn run_worker(
    mut writer: Box<dyn ContainerWriter>,
    jobs: mpsc::Receiver<Job>,
    shared: Arc<Mutex<Shared>>,
    label: String,
) {
    let mut start_error: Option<CaptureError> = None;

    // Also ends when every sender is gone, which finalizes best-effort
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Start(at) => {
                if let Err(e) = writer.start_session(at) {
                    tracing::error!("Failed to start writer session for {}: {}", label, e);
                    shared.lock().status = WriterStatus::Failed;
                    start_error = Some(e);
                }
            }
            Job::Append(frame) => {
                let result = match start_error {
                    Some(_) => Ok(()),
                    None => writer.append(&frame),
                };
                let mut shared = shared.lock();
                shared.in_flight = shared.in_flight.saturating_sub(1);
                if let Err(e) = result {
                    shared.append_errors += 1;
                    tracing::debug!("Append of {} frame at {} failed: {}", frame.kind(), frame.pts(), e);
                }
            }
            Job::Finish => break,
        }
    }

    let session_started = shared.lock().session_start.is_some();
    let outcome = match start_error {
        Some(e) => Err(CaptureError::FinalizeFailed(format!("writer never started: {}", e))),
        None if !session_started => Err(CaptureError::FinalizeFailed(
            "no frames were written".to_string(),
        )),
        None => writer.finish().map_err(|e| match e {
            CaptureError::FinalizeFailed(_) => e,
            other => CaptureError::FinalizeFailed(other.to_string()),
        }),
    };

    match &outcome {
        Ok(path) => tracing::info!("Finalized {}", path.display()),
        Err(e) => tracing::warn!("Finalize of {} failed: {}", label, e),
    }

    complete(&shared, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Start(Timestamp),
        Append(MediaKind, Timestamp),
        Finish,
    }

    /// Records every call; optionally blocks appends until released
    struct RecordingWriter {
        path: PathBuf,
        events: Arc<Mutex<Vec<Event>>>,
        gate: Option<mpsc::Receiver<()>>,
        fail_start: bool,
        fail_finish: bool,
    }

    impl ContainerWriter for RecordingWriter {
        fn start_session(&mut self, at: Timestamp) -> CaptureResult<()> {
            if self.fail_start {
                return Err(CaptureError::Io("disk full".to_string()));
            }
            self.events.lock().push(Event::Start(at));
            Ok(())
        }

        fn append(&mut self, frame: &FrameBuffer) -> CaptureResult<()> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            self.events.lock().push(Event::Append(frame.kind(), frame.pts()));
            Ok(())
        }

        fn finish(self: Box<Self>) -> CaptureResult<PathBuf> {
            self.events.lock().push(Event::Finish);
            if self.fail_finish {
                return Err(CaptureError::Io("trailer write failed".to_string()));
            }
            std::fs::write(&self.path, b"done")?;
            Ok(self.path.clone())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        encoder: StreamEncoder,
        events: Arc<Mutex<Vec<Event>>>,
    }

    fn harness(options: EncoderOptions, gate: Option<mpsc::Receiver<()>>, fail_start: bool) -> Harness {
        failing_harness(options, gate, fail_start, false)
    }

    fn failing_harness(
        options: EncoderOptions,
        gate: Option<mpsc::Receiver<()>>,
        fail_start: bool,
        fail_finish: bool,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let gate = Mutex::new(gate);
        let writer_events = events.clone();
        let factory = move |d: &OutputDescriptor| -> CaptureResult<Box<dyn ContainerWriter>> {
            Ok(Box::new(RecordingWriter {
                path: d.path().to_path_buf(),
                events: writer_events.clone(),
                gate: gate.lock().take(),
                fail_start,
                fail_finish,
            }))
        };
        let descriptor = OutputDescriptor::new(dir.path().join("out.mp4"), 1280, 720, 2, 44_100);
        let encoder = StreamEncoder::create(descriptor, &factory, options).unwrap();
        Harness {
            _dir: dir,
            encoder,
            events,
        }
    }

    fn video(ms: i64) -> FrameBuffer {
        FrameBuffer::video(Timestamp::from_millis(ms), 2, 2, PixelFormat::Rgba, vec![0u8; 16])
    }

    fn audio(ms: i64) -> FrameBuffer {
        FrameBuffer::audio_from_samples(Timestamp::from_millis(ms), 2, 44_100, &[0.0; 8])
    }

    fn finish_blocking(encoder: &StreamEncoder) -> FinishOutcome {
        let (tx, rx) = mpsc::channel();
        encoder.finish(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_first_frame_starts_session_and_regression_is_rejected() {
        let h = harness(EncoderOptions::default(), None, false);

        assert!(h.encoder.encode_frame(video(0)));
        assert_eq!(h.encoder.status(), WriterStatus::Writing);
        assert_eq!(h.encoder.stats().session_start, Some(Timestamp::ZERO));

        let rejected = h.encoder.try_encode_frame(video(-1));
        assert!(matches!(rejected, Err(CaptureError::OutOfOrderFrame { .. })));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (tx, rx) = mpsc::channel();
        h.encoder.finish(move |outcome| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(outcome);
        });
        let path = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"done");
        assert_eq!(
            *h.events.lock(),
            vec![
                Event::Start(Timestamp::ZERO),
                Event::Append(MediaKind::Video, Timestamp::ZERO),
                Event::Finish
            ]
        );
        assert_eq!(h.encoder.status(), WriterStatus::Completed);
    }

    #[test]
    fn test_tracks_are_monotonic_independently() {
        let h = harness(EncoderOptions::default(), None, false);

        assert!(h.encoder.encode_frame(video(100)));
        assert!(h.encoder.encode_frame(audio(100)));
        assert!(h.encoder.encode_frame(video(133)));
        // audio may lag video but not regress on its own track
        assert!(h.encoder.encode_frame(audio(120)));
        assert!(!h.encoder.encode_frame(audio(110)));
        // nothing before the session start
        assert!(!h.encoder.encode_frame(audio(50)));
        // equal timestamps are non-decreasing
        assert!(h.encoder.encode_frame(video(133)));

        let stats = h.encoder.stats();
        assert_eq!(stats.video.accepted, 3);
        assert_eq!(stats.audio.accepted, 2);
        assert_eq!(stats.audio.last_written, Some(Timestamp::from_millis(120)));

        finish_blocking(&h.encoder).unwrap();
        let appended: Vec<_> = h
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Append(MediaKind::Audio, ts) => Some(*ts),
                _ => None,
            })
            .collect();
        assert!(appended.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_video_first_policy_refuses_leading_audio() {
        let options = EncoderOptions {
            session_start: SessionStartPolicy::VideoFirst,
            ..EncoderOptions::default()
        };
        let h = harness(options, None, false);

        assert!(matches!(
            h.encoder.try_encode_frame(audio(0)),
            Err(CaptureError::WriterNotReady(_))
        ));
        assert!(h.encoder.encode_frame(video(10)));
        assert!(h.encoder.encode_frame(audio(10)));
        assert_eq!(h.encoder.stats().session_start, Some(Timestamp::from_millis(10)));
    }

    #[test]
    fn test_any_track_policy_lets_audio_start_session() {
        let h = harness(EncoderOptions::default(), None, false);
        assert!(h.encoder.encode_frame(audio(5)));
        assert!(h.encoder.encode_frame(video(5)));
        assert_eq!(h.encoder.stats().session_start, Some(Timestamp::from_millis(5)));
    }

    #[test]
    fn test_concurrent_finish_completes_each_caller_once() {
        let h = Arc::new(harness(EncoderOptions::default(), None, false));
        for ms in 0..20 {
            assert!(h.encoder.encode_frame(video(ms * 33)));
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let h = h.clone();
                let calls = calls.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    // interleave late frames with finish requests
                    h.encoder.encode_frame(video(1_000 + i));
                    h.encoder.finish(move |outcome| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = tx.send(outcome.is_ok());
                    });
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        for _ in 0..8 {
            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);

        let events = h.events.lock();
        assert_eq!(events.iter().filter(|e| **e == Event::Finish).count(), 1);
        assert_eq!(events.last(), Some(&Event::Finish));
    }

    #[test]
    fn test_frames_after_finish_are_rejected() {
        let h = harness(EncoderOptions::default(), None, false);
        assert!(h.encoder.encode_frame(video(0)));
        finish_blocking(&h.encoder).unwrap();

        assert!(matches!(
            h.encoder.try_encode_frame(video(10)),
            Err(CaptureError::WriterNotReady(_))
        ));
        // late finish gets the stored outcome
        assert!(finish_blocking(&h.encoder).is_ok());
        assert_eq!(h.events.lock().iter().filter(|e| **e == Event::Finish).count(), 1);
    }

    #[test]
    fn test_saturated_queue_drops_frames() {
        let (release, gate) = mpsc::channel();
        let options = EncoderOptions {
            queue_depth: 2,
            ..EncoderOptions::default()
        };
        let h = harness(options, Some(gate), false);

        assert!(h.encoder.encode_frame(video(0)));
        assert!(h.encoder.encode_frame(video(33)));
        assert!(matches!(
            h.encoder.try_encode_frame(video(66)),
            Err(CaptureError::FrameDropped)
        ));
        assert_eq!(h.encoder.stats().dropped, 1);
        // a dropped frame does not advance the track
        assert_eq!(
            h.encoder.stats().video.last_written,
            Some(Timestamp::from_millis(33))
        );

        release.send(()).unwrap();
        release.send(()).unwrap();
        drop(release);
        finish_blocking(&h.encoder).unwrap();
        assert_eq!(h.encoder.stats().video.accepted, 2);
    }

    #[test]
    fn test_finish_without_frames_fails() {
        let h = harness(EncoderOptions::default(), None, false);
        assert!(matches!(
            finish_blocking(&h.encoder),
            Err(CaptureError::FinalizeFailed(_))
        ));
        assert_eq!(h.encoder.status(), WriterStatus::Failed);
    }

    #[test]
    fn test_start_failure_surfaces_on_finish() {
        let h = harness(EncoderOptions::default(), None, true);
        assert!(h.encoder.encode_frame(video(0)));
        let outcome = finish_blocking(&h.encoder);
        match outcome {
            Err(CaptureError::FinalizeFailed(message)) => assert!(message.contains("disk full")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_writer_finish_failure_completes_once() {
        let h = failing_harness(EncoderOptions::default(), None, false, true);
        assert!(h.encoder.encode_frame(video(0)));
        assert!(h.encoder.encode_frame(audio(0)));

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let calls = calls.clone();
            let tx = tx.clone();
            h.encoder.finish(move |outcome| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(outcome);
            });
        }
        for _ in 0..3 {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Err(CaptureError::FinalizeFailed(message)) => {
                    assert!(message.contains("trailer write failed"))
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.encoder.status(), WriterStatus::Failed);
        assert!(!h.encoder.status().is_accepting());

        let events = h.events.lock();
        assert_eq!(events.iter().filter(|e| **e == Event::Finish).count(), 1);
        assert_eq!(events.first(), Some(&Event::Start(Timestamp::ZERO)));
    }

    #[test]
    fn test_invalid_descriptor_is_rejected_before_writer_opens() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let factory = move |_: &OutputDescriptor| -> CaptureResult<Box<dyn ContainerWriter>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CaptureError::Io("unreachable".to_string()))
        };
        let descriptor = OutputDescriptor::new("/tmp/never.mp4", 0, 720, 2, 44_100);
        let result = StreamEncoder::create(descriptor, &factory, EncoderOptions::default());
        assert!(matches!(result, Err(CaptureError::InvalidDescriptor(_))));
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }
}
