//! Frame types flowing through the playback pipeline

use bytes::Bytes;
use std::time::Duration;

/// One encoded audio frame as delimited from the network stream.
///
/// The sequence index is assigned locally in arrival order; the wire
/// format carries no timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Opaque codec payload
    pub payload: Bytes,
    /// Arrival-order index, starting at 0 for a session
    pub sequence: u64,
    /// Nominal duration of the audio this frame carries
    pub duration: Duration,
}

impl EncodedFrame {
    pub fn new(payload: Bytes, sequence: u64, duration: Duration) -> Self {
        Self {
            payload,
            sequence,
            duration,
        }
    }

    /// Synthetic presentation timestamp (`sequence * duration`)
    pub fn timestamp(&self) -> Duration {
        Duration::from_nanos((self.duration.as_nanos() * self.sequence as u128) as u64)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Decoded PCM ready to be scheduled on the output device
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Interleaved f32 samples
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Sequence index of the encoded frame this was decoded from
    pub sequence: u64,
}

impl DecodedFrame {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
            sequence,
        }
    }

    /// Silent frame of the given length in samples per channel
    pub fn silence(frames: usize, channels: u16, sample_rate: u32, sequence: u64) -> Self {
        Self::new(
            vec![0.0; frames * channels as usize],
            channels,
            sample_rate,
            sequence,
        )
    }

    /// Number of samples per channel
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Playback duration, exact to the nanosecond
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frames() as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }
}
