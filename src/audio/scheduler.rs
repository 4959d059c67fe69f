//! Gapless playback scheduling
//!
//! The scheduler keeps a single cursor, `next_play_time`, on the device
//! clock. Every decoded frame starts where the previous one ended, so as
//! long as frames arrive before the cursor passes the device clock the
//! output is gapless. When the device clock overtakes the cursor (the
//! network or decoder fell behind) the frame is placed a safety margin
//! after "now" instead of in the past, and contiguity resumes from there.
//!
//! The scheduler is owned by exactly one task and mutated through
//! `&mut self`; there is no other writer of the cursor.

use std::time::Duration;

use crate::audio::frame::DecodedFrame;
use crate::audio::output::AudioOutput;
use crate::error::AudioError;

/// Where a frame was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub sequence: u64,
    pub at: Duration,
    pub duration: Duration,
    /// The cursor had fallen behind the device clock
    pub resynced: bool,
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub frames_scheduled: u64,
    pub resyncs: u64,
    /// Start of the first scheduled frame
    pub first_start: Option<Duration>,
    /// End of the last scheduled frame
    pub last_end: Option<Duration>,
}

impl SchedulerStats {
    /// Device time covered from the first frame's start to the last frame's end
    pub fn scheduled_span(&self) -> Duration {
        match (self.first_start, self.last_end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => Duration::ZERO,
        }
    }
}

/// Places decoded frames back to back on an output device
pub struct PlaybackScheduler<O> {
    output: O,
    next_play_time: Duration,
    safety_margin: Duration,
    started: bool,
    stats: SchedulerStats,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O, safety_margin: Duration) -> Self {
        Self {
            output,
            next_play_time: Duration::ZERO,
            safety_margin,
            started: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Anchor the cursor to the device clock. Called at session start.
    pub fn start(&mut self) {
        self.next_play_time = self.output.current_time();
        self.started = true;
        tracing::debug!("Playback cursor anchored at {:?}", self.next_play_time);
    }

    /// Schedule one frame.
    ///
    /// The cursor always advances to the end of the frame's slot, even if
    /// the device then rejects the frame.
    pub fn schedule(&mut self, frame: DecodedFrame) -> Result<Scheduled, AudioError> {
        if !self.started {
            self.start();
        }

        let now = self.output.current_time();
        let resynced = self.next_play_time < now;
        let at = if resynced {
            let at = now + self.safety_margin;
            tracing::warn!(
                "Playback underrun before frame {}: cursor {:?} behind clock {:?}, resyncing to {:?}",
                frame.sequence,
                self.next_play_time,
                now,
                at
            );
            self.stats.resyncs += 1;
            at
        } else {
            self.next_play_time
        };

        let duration = frame.duration();
        let sequence = frame.sequence;
        self.next_play_time = at + duration;

        self.output.schedule(frame, at)?;

        self.stats.frames_scheduled += 1;
        if self.stats.first_start.is_none() {
            self.stats.first_start = Some(at);
        }
        self.stats.last_end = Some(self.next_play_time);

        Ok(Scheduled {
            sequence,
            at,
            duration,
            resynced,
        })
    }

    /// Release every unplayed frame and re-anchor the cursor
    pub fn reset(&mut self) {
        self.output.flush();
        self.next_play_time = self.output.current_time();
        tracing::debug!("Playback cursor reset to {:?}", self.next_play_time);
    }

    /// Cursor position: where the next frame will start if no underrun occurs
    pub fn next_play_time(&self) -> Duration {
        self.next_play_time
    }

    /// How far ahead of the device clock audio is already scheduled
    pub fn buffered_ahead(&self) -> Duration {
        self.next_play_time
            .saturating_sub(self.output.current_time())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Flush and close the device, returning the output
    pub fn stop(mut self) -> (O, SchedulerStats) {
        self.reset();
        self.started = false;
        self.output.close();
        (self.output, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{frame_ms, RecordingOutput};

    const FIVE_MS: Duration = Duration::from_millis(5);

    fn scheduler(output: RecordingOutput) -> PlaybackScheduler<RecordingOutput> {
        let mut scheduler = PlaybackScheduler::new(output, FIVE_MS);
        scheduler.start();
        scheduler
    }

    #[test]
    fn test_gapless_without_underrun() {
        let output = RecordingOutput::new();
        output.set_time(Duration::from_millis(100));
        let mut scheduler = scheduler(output.clone());

        for n in 0..50u64 {
            let scheduled = scheduler.schedule(frame_ms(n, 5)).unwrap();
            assert_eq!(scheduled.at, Duration::from_millis(100) + FIVE_MS * n as u32);
            assert!(!scheduled.resynced);
        }

        let stats = scheduler.stats();
        assert_eq!(stats.resyncs, 0);
        assert_eq!(stats.frames_scheduled, 50);
        assert_eq!(stats.scheduled_span(), Duration::from_millis(250));
        assert_eq!(output.scheduled().len(), 50);
    }

    #[test]
    fn test_underrun_resyncs_to_now_plus_margin() {
        let output = RecordingOutput::new();
        let mut scheduler = scheduler(output.clone());

        scheduler.schedule(frame_ms(0, 5)).unwrap();
        scheduler.schedule(frame_ms(1, 5)).unwrap();
        assert_eq!(scheduler.next_play_time(), Duration::from_millis(10));

        // Stall: the device clock runs past the cursor
        output.set_time(Duration::from_millis(42));
        let scheduled = scheduler.schedule(frame_ms(2, 5)).unwrap();
        assert!(scheduled.resynced);
        assert_eq!(scheduled.at, Duration::from_millis(47));
        assert!(scheduled.at > output.current_time());

        // Contiguous again from the resync point
        let next = scheduler.schedule(frame_ms(3, 5)).unwrap();
        assert!(!next.resynced);
        assert_eq!(next.at, Duration::from_millis(52));
        assert_eq!(scheduler.stats().resyncs, 1);
    }

    #[test]
    fn test_cursor_equal_to_clock_is_not_an_underrun() {
        let output = RecordingOutput::new();
        let mut scheduler = scheduler(output.clone());

        scheduler.schedule(frame_ms(0, 5)).unwrap();
        output.set_time(FIVE_MS);
        let scheduled = scheduler.schedule(frame_ms(1, 5)).unwrap();
        assert!(!scheduled.resynced);
        assert_eq!(scheduled.at, FIVE_MS);
    }

    #[test]
    fn test_cursor_never_decreases() {
        let output = RecordingOutput::new();
        let mut scheduler = scheduler(output.clone());

        let mut last = Duration::ZERO;
        for (n, clock_ms) in [0u64, 3, 30, 31, 32, 200, 201].into_iter().enumerate() {
            output.set_time(Duration::from_millis(clock_ms));
            let scheduled = scheduler.schedule(frame_ms(n as u64, 5)).unwrap();
            assert!(scheduled.at >= last);
            assert!(scheduled.at >= output.current_time());
            last = scheduler.next_play_time();
        }
    }

    #[test]
    fn test_rejected_frame_still_advances_cursor() {
        let output = RecordingOutput::new();
        let mut scheduler = scheduler(output.clone());

        output.reject_next();
        assert!(scheduler.schedule(frame_ms(0, 5)).is_err());
        assert_eq!(scheduler.next_play_time(), FIVE_MS);
        assert_eq!(scheduler.stats().frames_scheduled, 0);
    }

    #[test]
    fn test_reset_flushes_and_reanchors() {
        let output = RecordingOutput::new();
        let mut scheduler = scheduler(output.clone());

        for n in 0..4 {
            scheduler.schedule(frame_ms(n, 5)).unwrap();
        }
        output.set_time(Duration::from_millis(7));
        assert_eq!(scheduler.buffered_ahead(), Duration::from_millis(13));

        scheduler.reset();
        assert_eq!(output.flushes(), 1);
        assert_eq!(scheduler.next_play_time(), Duration::from_millis(7));

        let (_, stats) = scheduler.stop();
        assert!(output.is_closed());
        assert_eq!(stats.frames_scheduled, 4);
    }
}
