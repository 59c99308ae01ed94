//! Pause re-basing
//!
//! Source timestamps keep running while a session is paused. On the first
//! frame after a resume the gap since the last frame of that kind, minus the
//! kind's normal frame interval, is added to a running offset. The offset
//! applies to both kinds, so the output timeline continues as if the pause
//! had lasted a single frame interval.

use crate::capture::frame::{FrameBuffer, MediaKind, Timestamp};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Timeline {
    offset: Timestamp,
    origin: Option<Timestamp>,
    latest: Option<Timestamp>,
    last_source: [Option<Timestamp>; 2],
    last_interval: [Option<Timestamp>; 2],
    video_interval_hint: Timestamp,
    rebase_pending: bool,
    skip_interval: [bool; 2],
}

impl Timeline {
    /// `video_interval_hint` stands in for the video interval until two
    /// frames have been seen (usually 1/fps).
    pub fn new(video_interval_hint: Timestamp) -> Self {
        Self {
            offset: Timestamp::ZERO,
            origin: None,
            latest: None,
            last_source: [None; 2],
            last_interval: [None; 2],
            video_interval_hint,
            rebase_pending: false,
            skip_interval: [false; 2],
        }
    }

    /// Arm the offset adjustment for the first frame after resume
    pub fn resume(&mut self) {
        self.rebase_pending = true;
        // the first frame of each kind spans the pause, not a frame interval
        self.skip_interval = [true; 2];
    }

    /// Map a source frame onto the output timeline. Only call for frames
    /// that arrive while capturing.
    pub fn rebase(&mut self, frame: &FrameBuffer) -> Timestamp {
        let kind = frame.kind();
        let pts = frame.pts();
        let idx = kind.index();

        if self.rebase_pending {
            self.rebase_pending = false;
            if let Some(previous) = self.last_source[idx] {
                let interval = self.interval(kind, frame);
                let gap = pts - previous;
                let removed = gap - interval;
                if removed > Timestamp::ZERO {
                    self.offset = self.offset + removed;
                    tracing::debug!(
                        "Re-based after pause: removed {}, total offset {}",
                        removed,
                        self.offset
                    );
                }
            }
        }

        if self.skip_interval[idx] {
            self.skip_interval[idx] = false;
        } else if let Some(previous) = self.last_source[idx] {
            let interval = pts - previous;
            if interval > Timestamp::ZERO {
                self.last_interval[idx] = Some(interval);
            }
        }

        self.last_source[idx] = Some(pts);
        if kind == MediaKind::Audio && self.last_interval[idx].is_none() {
            let duration = frame.duration();
            if duration > Timestamp::ZERO {
                self.last_interval[idx] = Some(duration);
            }
        }

        let rebased = pts - self.offset;
        self.origin.get_or_insert(rebased);
        if self.latest.map_or(true, |latest| rebased > latest) {
            self.latest = Some(rebased);
        }
        rebased
    }

    fn interval(&self, kind: MediaKind, frame: &FrameBuffer) -> Timestamp {
        if let Some(interval) = self.last_interval[kind.index()] {
            return interval;
        }
        match kind {
            MediaKind::Video => self.video_interval_hint,
            MediaKind::Audio => frame.duration(),
        }
    }

    /// Active time of a re-based timestamp since the first frame
    pub fn elapsed_at(&self, rebased: Timestamp) -> Duration {
        match self.origin {
            Some(origin) => (rebased - origin).to_duration(),
            None => Duration::ZERO,
        }
    }

    /// Active time up to the latest re-based frame
    pub fn elapsed(&self) -> Duration {
        self.latest.map(|latest| self.elapsed_at(latest)).unwrap_or_default()
    }

    /// Total source time removed by pauses
    pub fn paused_total(&self) -> Duration {
        self.offset.to_duration()
    }
}
