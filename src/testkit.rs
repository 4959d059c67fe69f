//! Test doubles shared by unit tests

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::audio::frame::{DecodedFrame, EncodedFrame};
use crate::audio::output::AudioOutput;
use crate::codec::decoder::{DecoderState, FrameDecoder};
use crate::error::{AudioError, CodecError};
use crate::network::framing::FrameStream;

const RATE: u32 = 48000;
const FIVE_MS: Duration = Duration::from_millis(5);

/// Mono 48 kHz frame lasting `ms` milliseconds
pub fn frame_ms(sequence: u64, ms: u64) -> DecodedFrame {
    DecodedFrame::silence((RATE as u64 * ms / 1000) as usize, 1, RATE, sequence)
}

/// 5 ms encoded frame
pub fn encoded(sequence: u64, payload: &[u8]) -> EncodedFrame {
    EncodedFrame::new(Bytes::copy_from_slice(payload), sequence, FIVE_MS)
}

enum Clock {
    Manual(Duration),
    /// Time elapsed on the tokio clock since `base`
    Tokio(Instant),
}

struct Recording {
    clock: Clock,
    scheduled: Vec<(u64, Duration)>,
    reject_next: bool,
    flushes: usize,
    closed: bool,
}

/// Output that records every placement against a controllable clock
#[derive(Clone)]
pub struct RecordingOutput {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingOutput {
    /// Manual clock starting at zero
    pub fn new() -> Self {
        Self::with_clock(Clock::Manual(Duration::ZERO))
    }

    /// Clock that follows tokio time from `base`
    pub fn following(base: Instant) -> Self {
        Self::with_clock(Clock::Tokio(base))
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Recording {
                clock,
                scheduled: Vec::new(),
                reject_next: false,
                flushes: 0,
                closed: false,
            })),
        }
    }

    pub fn set_time(&self, now: Duration) {
        self.inner.lock().clock = Clock::Manual(now);
    }

    /// `(sequence, start)` of every accepted frame
    pub fn scheduled(&self) -> Vec<(u64, Duration)> {
        self.inner.lock().scheduled.clone()
    }

    pub fn reject_next(&self) {
        self.inner.lock().reject_next = true;
    }

    pub fn flushes(&self) -> usize {
        self.inner.lock().flushes
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl AudioOutput for RecordingOutput {
    fn current_time(&self) -> Duration {
        match self.inner.lock().clock {
            Clock::Manual(now) => now,
            Clock::Tokio(base) => Instant::now().duration_since(base),
        }
    }

    fn schedule(&mut self, frame: DecodedFrame, at: Duration) -> Result<(), AudioError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(AudioError::DeviceClosed);
        }
        if inner.reject_next {
            inner.reject_next = false;
            return Err(AudioError::QueueFull(frame.sequence));
        }
        inner.scheduled.push((frame.sequence, at));
        Ok(())
    }

    fn flush(&mut self) {
        self.inner.lock().flushes += 1;
    }

    fn close(&mut self) {
        self.inner.lock().closed = true;
    }
}

/// Decoder that turns every frame into 5 ms of mono silence
pub struct ScriptedDecoder {
    state: DecoderState,
    fail_on: Vec<u64>,
    close_on: Option<u64>,
    flushes: usize,
}

impl ScriptedDecoder {
    /// Already configured
    pub fn new() -> Self {
        Self {
            state: DecoderState::Configured,
            fail_on: Vec::new(),
            close_on: None,
            flushes: 0,
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            state: DecoderState::Unconfigured,
            ..Self::new()
        }
    }

    /// Fails to decode the given sequence indices
    pub fn failing_on(sequences: &[u64]) -> Self {
        Self {
            fail_on: sequences.to_vec(),
            ..Self::new()
        }
    }

    /// Closes itself when it reaches `sequence`
    pub fn closing_on(sequence: u64) -> Self {
        Self {
            close_on: Some(sequence),
            ..Self::new()
        }
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl FrameDecoder for ScriptedDecoder {
    fn configure(&mut self, _codec: &str, _sample_rate: u32, _channels: u16) -> Result<(), CodecError> {
        if self.state == DecoderState::Closed {
            return Err(CodecError::DecoderClosed);
        }
        self.state = DecoderState::Configured;
        Ok(())
    }

    fn state(&self) -> DecoderState {
        self.state
    }

    fn decode(&mut self, frame: &EncodedFrame) -> Result<Option<DecodedFrame>, CodecError> {
        if self.close_on == Some(frame.sequence) {
            self.state = DecoderState::Closed;
        }
        if self.state == DecoderState::Closed {
            return Err(CodecError::DecoderClosed);
        }
        if self.fail_on.contains(&frame.sequence) {
            return Err(CodecError::DecodingFailed(format!("scripted failure {}", frame.sequence)));
        }
        Ok(Some(frame_ms(frame.sequence, 5)))
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.flushes += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.state = DecoderState::Closed;
    }
}

/// Transport delivering each payload at its arrival time (relative to
/// `base` on the tokio clock), then ending cleanly
pub fn paced_transport(base: Instant, arrivals: Vec<(Duration, Bytes)>) -> FrameStream {
    let items = arrivals.into_iter().map(|(at, bytes)| (at, Ok(bytes)));
    scripted_transport(base, items.collect())
}

/// Like `paced_transport`, with arbitrary items (errors included)
pub fn scripted_transport(base: Instant, items: Vec<(Duration, io::Result<Bytes>)>) -> FrameStream {
    Box::pin(futures_util::stream::iter(items).then(move |(at, item)| async move {
        let deadline = base + at;
        if Instant::now() < deadline {
            tokio::time::sleep_until(deadline).await;
        }
        item
    }))
}

/// One payload every 5 ms starting at zero
pub fn steady_arrivals(count: u64) -> Vec<(Duration, Bytes)> {
    (0..count)
        .map(|n| (FIVE_MS * n as u32, Bytes::from(n.to_be_bytes().to_vec())))
        .collect()
}
