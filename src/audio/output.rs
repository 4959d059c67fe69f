//! Audio output boundary
//!
//! The scheduler only needs two things from a device: its clock, and a way
//! to place a decoded frame at a point on that clock. `CpalOutput` provides
//! both on top of a cpal output stream by rendering scheduled frames onto a
//! sample-accurate timeline inside the audio callback.
//!
//! The callback never locks or allocates: frames arrive through a bounded
//! lock-free queue, the clock is an atomic sample counter, and consumed
//! frames are handed back so their memory is released off the audio thread.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{find_device, Direction};
use crate::audio::frame::DecodedFrame;
use crate::error::AudioError;

/// Device clock and scheduled playback
pub trait AudioOutput: Send {
    /// Current reading of the device clock
    fn current_time(&self) -> Duration;

    /// Play `frame` starting at device time `at`
    fn schedule(&mut self, frame: DecodedFrame, at: Duration) -> Result<(), AudioError>;

    /// Release every scheduled frame that has not been played yet
    fn flush(&mut self);

    /// Stop the device and release its resources
    fn close(&mut self);
}

/// Convert a device-clock position to a sample index
fn to_samples(at: Duration, sample_rate: u32) -> u64 {
    (at.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}

fn to_duration(samples: u64, sample_rate: u32) -> Duration {
    Duration::from_nanos((samples as u128 * 1_000_000_000 / sample_rate as u128) as u64)
}

/// A frame placed on the output timeline
struct Placed {
    start: u64,
    frame: DecodedFrame,
    generation: u64,
    played: bool,
}

impl Placed {
    fn end(&self) -> u64 {
        self.start + self.frame.frames() as u64
    }
}

/// State shared between the scheduling side and the audio callback
struct Timeline {
    /// Samples rendered since the stream started
    clock: AtomicU64,
    incoming: ArrayQueue<Placed>,
    consumed: ArrayQueue<DecodedFrame>,
    /// Bumped on flush; frames from older generations are discarded
    generation: AtomicU64,
    frames_played: AtomicU64,
    frames_late: AtomicU64,
    silent_samples: AtomicU64,
}

impl Timeline {
    fn new(capacity: usize) -> Self {
        Self {
            clock: AtomicU64::new(0),
            incoming: ArrayQueue::new(capacity.max(1)),
            consumed: ArrayQueue::new(capacity.max(1)),
            generation: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            frames_late: AtomicU64::new(0),
            silent_samples: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> OutputStats {
        OutputStats {
            frames_played: self.frames_played.load(Ordering::Relaxed),
            frames_late: self.frames_late.load(Ordering::Relaxed),
            silent_samples: self.silent_samples.load(Ordering::Relaxed),
        }
    }

    fn release(&self, frame: DecodedFrame) {
        // A full return queue means the scheduling side stopped reclaiming;
        // dropping here is the fallback.
        let _ = self.consumed.push(frame);
    }
}

/// Callback-owned renderer
struct Renderer {
    timeline: Arc<Timeline>,
    /// Holds at most `capacity` frames; the rest wait in `incoming`
    pending: VecDeque<Placed>,
    capacity: usize,
    generation: u64,
    channels: usize,
}

impl Renderer {
    fn new(timeline: Arc<Timeline>, channels: u16, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            timeline,
            pending: VecDeque::with_capacity(capacity),
            capacity,
            generation: 0,
            channels: channels.max(1) as usize,
        }
    }

    /// Move frames from `incoming` into `pending` while there is room
    fn admit(&mut self, generation: u64) {
        while self.pending.len() < self.capacity {
            let Some(placed) = self.timeline.incoming.pop() else {
                break;
            };
            if placed.generation == generation {
                self.pending.push_back(placed);
            } else {
                self.timeline.release(placed.frame);
            }
        }
    }

    /// Drop pending frames whose span ends at or before `t`
    fn retire_before(&mut self, t: u64) -> bool {
        let mut retired = false;
        while let Some(front) = self.pending.front() {
            if front.end() > t {
                break;
            }
            if let Some(done) = self.pending.pop_front() {
                if done.played {
                    self.timeline.frames_played.fetch_add(1, Ordering::Relaxed);
                } else {
                    // Never reached the speaker
                    self.timeline.frames_late.fetch_add(1, Ordering::Relaxed);
                }
                self.timeline.release(done.frame);
                retired = true;
            }
        }
        retired
    }

    fn render(&mut self, data: &mut [f32]) {
        let generation = self.timeline.generation.load(Ordering::Acquire);
        if generation != self.generation {
            while let Some(placed) = self.pending.pop_front() {
                self.timeline.release(placed.frame);
            }
            self.generation = generation;
        }

        self.admit(generation);

        let clock = self.timeline.clock.load(Ordering::Relaxed);
        let frames = data.len() / self.channels;
        let mut silent = 0u64;

        for (i, out) in data.chunks_exact_mut(self.channels).enumerate() {
            let t = clock + i as u64;

            // Retire frames already behind the clock, refilling as room frees up
            while self.retire_before(t) {
                self.admit(generation);
            }

            match self.pending.front_mut() {
                Some(front) if front.start <= t => {
                    front.played = true;
                    let src_channels = front.frame.channels.max(1) as usize;
                    let offset = (t - front.start) as usize * src_channels;
                    for (c, sample) in out.iter_mut().enumerate() {
                        *sample = front
                            .frame
                            .samples
                            .get(offset + c % src_channels)
                            .copied()
                            .unwrap_or(0.0);
                    }
                }
                _ => {
                    out.fill(0.0);
                    silent += 1;
                }
            }
        }

        self.timeline
            .clock
            .store(clock + frames as u64, Ordering::Release);
        if silent > 0 {
            self.timeline
                .silent_samples
                .fetch_add(silent, Ordering::Relaxed);
        }
    }
}

/// Output statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub frames_played: u64,
    /// Frames whose whole span was already in the past when rendered
    pub frames_late: u64,
    /// Output samples (per channel) filled with silence
    pub silent_samples: u64,
}

/// Read-only view of a `CpalOutput`'s counters
#[derive(Clone)]
pub struct OutputMonitor {
    timeline: Arc<Timeline>,
}

impl OutputMonitor {
    pub fn stats(&self) -> OutputStats {
        self.timeline.stats()
    }
}

/// cpal-backed output with a scheduled timeline
pub struct CpalOutput {
    timeline: Arc<Timeline>,
    sample_rate: u32,
    channels: u16,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
}

impl CpalOutput {
    /// Open an output stream on `device_id` (default device if `None`).
    ///
    /// The stream runs at `sample_rate` with the device's preferred channel
    /// count; mono frames are duplicated across all output channels.
    pub fn open(
        device_id: Option<&str>,
        sample_rate: u32,
        queue_capacity: usize,
    ) -> Result<Self, AudioError> {
        let timeline = Arc::new(Timeline::new(queue_capacity));
        let running = Arc::new(AtomicBool::new(true));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<u16, AudioError>>(1);

        let device_id = device_id.map(str::to_string);
        let thread_timeline = timeline.clone();
        let thread_running = running.clone();

        let handle = thread::Builder::new()
            .name("playback-output".into())
            .spawn(move || {
                let setup = || -> Result<(cpal::Stream, u16), AudioError> {
                    let device = find_device(device_id.as_deref(), Direction::Output)?;
                    let default_config = device
                        .default_output_config()
                        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
                    let config = StreamConfig {
                        channels: default_config.channels(),
                        sample_rate: cpal::SampleRate(sample_rate),
                        buffer_size: cpal::BufferSize::Default,
                    };

                    let mut renderer =
                        Renderer::new(thread_timeline, config.channels, queue_capacity);
                    let stream = device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                renderer.render(data);
                            },
                            move |err| {
                                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                            },
                            None,
                        )
                        .map_err(|e| AudioError::StreamError(e.to_string()))?;
                    stream
                        .play()
                        .map_err(|e| AudioError::StreamError(e.to_string()))?;
                    Ok((stream, config.channels))
                };

                match setup() {
                    Ok((stream, channels)) => {
                        let _ = ready_tx.send(Ok(channels));
                        while thread_running.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let channels = match ready_rx.recv() {
            Ok(Ok(channels)) => channels,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::StreamError("output thread exited".into()));
            }
        };

        tracing::info!(
            "Output stream open: {}Hz, {} channels, queue {}",
            sample_rate,
            channels,
            queue_capacity
        );

        Ok(Self {
            timeline,
            sample_rate,
            channels,
            running,
            thread_handle: Some(handle),
            error_rx,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Stats reader that stays valid after the output is handed to a session
    pub fn monitor(&self) -> OutputMonitor {
        OutputMonitor {
            timeline: self.timeline.clone(),
        }
    }

    /// Drop frames the callback has finished with
    fn reclaim(&self) -> usize {
        let mut count = 0;
        while self.timeline.consumed.pop().is_some() {
            count += 1;
        }
        count
    }
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> Duration {
        to_duration(
            self.timeline.clock.load(Ordering::Acquire),
            self.sample_rate,
        )
    }

    fn schedule(&mut self, frame: DecodedFrame, at: Duration) -> Result<(), AudioError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(AudioError::DeviceClosed);
        }
        if let Ok(err) = self.error_rx.try_recv() {
            return Err(err);
        }
        if frame.sample_rate != self.sample_rate {
            return Err(AudioError::UnsupportedFormat(format!(
                "frame at {}Hz on a {}Hz device",
                frame.sample_rate, self.sample_rate
            )));
        }

        self.reclaim();

        let sequence = frame.sequence;
        let placed = Placed {
            start: to_samples(at, self.sample_rate),
            frame,
            generation: self.timeline.generation.load(Ordering::Acquire),
            played: false,
        };
        self.timeline
            .incoming
            .push(placed)
            .map_err(|_| AudioError::QueueFull(sequence))
    }

    fn flush(&mut self) {
        self.timeline.generation.fetch_add(1, Ordering::AcqRel);
        while let Some(placed) = self.timeline.incoming.pop() {
            drop(placed);
        }
        self.reclaim();
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.reclaim();
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(timeline: &Timeline, start: u64, value: f32, frames: usize, sequence: u64) {
        let frame = DecodedFrame::new(vec![value; frames], 1, 48000, sequence);
        let placed = Placed {
            start,
            frame,
            generation: timeline.generation.load(Ordering::Acquire),
            played: false,
        };
        assert!(timeline.incoming.push(placed).is_ok());
    }

    #[test]
    fn test_clock_conversions() {
        assert_eq!(to_samples(Duration::from_millis(5), 48000), 240);
        assert_eq!(to_duration(240, 48000), Duration::from_millis(5));
        assert_eq!(to_samples(Duration::ZERO, 48000), 0);
    }

    #[test]
    fn test_renderer_places_frames_on_timeline() {
        let timeline = Arc::new(Timeline::new(8));
        let mut renderer = Renderer::new(timeline.clone(), 2, 8);

        // Gap of 2 samples, then 4 samples of 0.5, then 0.25 directly after
        place(&timeline, 2, 0.5, 4, 0);
        place(&timeline, 6, 0.25, 4, 1);

        let mut data = vec![9.0f32; 8 * 2];
        renderer.render(&mut data);

        let left: Vec<f32> = data.chunks(2).map(|c| c[0]).collect();
        assert_eq!(left, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.25, 0.25]);
        // Mono duplicated to both channels
        assert!(data.chunks(2).all(|c| c[0] == c[1]));
        assert_eq!(timeline.clock.load(Ordering::Relaxed), 8);
        assert_eq!(timeline.silent_samples.load(Ordering::Relaxed), 2);

        let mut data = vec![9.0f32; 4 * 2];
        renderer.render(&mut data);
        assert_eq!(data[0], 0.25);
        assert_eq!(data[4], 0.0);
        assert_eq!(timeline.frames_played.load(Ordering::Relaxed), 2);
        assert_eq!(timeline.consumed.len(), 2);
    }

    #[test]
    fn test_renderer_holds_at_most_capacity_frames() {
        let timeline = Arc::new(Timeline::new(8));
        let mut renderer = Renderer::new(timeline.clone(), 1, 2);

        for n in 0..5u64 {
            place(&timeline, 4 + n * 4, n as f32, 4, n);
        }

        let reserved = renderer.pending.capacity();
        let mut data = vec![0.0f32; 4];
        renderer.render(&mut data);
        assert_eq!(renderer.pending.len(), 2);
        assert_eq!(timeline.incoming.len(), 3);

        // Later frames are admitted as earlier ones finish, without a gap
        let mut data = vec![9.0f32; 20];
        renderer.render(&mut data);
        assert_eq!(
            data,
            vec![
                0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0,
                4.0, 4.0, 4.0, 4.0
            ]
        );
        assert_eq!(renderer.pending.capacity(), reserved);
        assert!(timeline.incoming.is_empty());

        let monitor = OutputMonitor { timeline };
        assert_eq!(
            monitor.stats(),
            OutputStats {
                frames_played: 4,
                frames_late: 0,
                silent_samples: 4,
            }
        );
    }

    #[test]
    fn test_renderer_discards_stale_and_flushed_frames() {
        let timeline = Arc::new(Timeline::new(8));
        let mut renderer = Renderer::new(timeline.clone(), 1, 8);

        let mut data = vec![0.0f32; 10];
        renderer.render(&mut data);

        // Entirely in the past
        place(&timeline, 0, 1.0, 4, 0);
        renderer.render(&mut data);
        assert!(data.iter().all(|s| *s == 0.0));
        assert_eq!(timeline.frames_late.load(Ordering::Relaxed), 1);

        // Scheduled, then flushed before it plays
        place(&timeline, 40, 1.0, 4, 1);
        renderer.render(&mut data);
        timeline.generation.fetch_add(1, Ordering::AcqRel);
        let mut data = vec![0.0f32; 40];
        renderer.render(&mut data);
        assert!(data.iter().all(|s| *s == 0.0));
        assert_eq!(timeline.consumed.len(), 2);
        assert_eq!(timeline.frames_played.load(Ordering::Relaxed), 0);
    }
}
