//! Opus encoding for the sending side
//!
//! `FrameEncoder` turns an arbitrary-sized stream of captured samples into
//! fixed-duration encoded frames, one network write each.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::config::{EncoderConfig, OpusApplication, StreamConfig};
use crate::error::CodecError;

/// Opus encoder wrapper
pub struct OpusEncoder {
    encoder: Encoder,
    channels: u16,
    /// Samples per channel in one frame
    frame_size: usize,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(stream: &StreamConfig, config: &EncoderConfig) -> Result<Self, CodecError> {
        let channels = match stream.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    stream.channels
                )))
            }
        };

        let application = match config.application {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(stream.sample_rate, channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_complexity(config.complexity.min(10) as i32)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set complexity: {}", e)))?;

        Ok(Self {
            encoder,
            channels: stream.channels,
            frame_size: stream.frame_size(),
            // Max Opus packet is about 1275 bytes per frame
            encode_buffer: vec![0u8; 4000],
        })
    }

    /// Encode exactly one frame of interleaved samples
    pub fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Samples per channel in one frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Interleaved samples in one frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }
}

/// Throughput since the last `take_rate` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeRate {
    pub raw_bytes: u64,
    pub encoded_bytes: u64,
    pub frames: u64,
}

/// Accumulates captured samples into fixed frames and encodes them
pub struct FrameEncoder {
    encoder: OpusEncoder,
    pending: Vec<f32>,
    rate: EncodeRate,
    frames_encoded: u64,
}

impl FrameEncoder {
    pub fn new(encoder: OpusEncoder) -> Self {
        let capacity = encoder.samples_per_frame() * 5;
        Self {
            encoder,
            pending: Vec::with_capacity(capacity),
            rate: EncodeRate::default(),
            frames_encoded: 0,
        }
    }

    /// Add captured samples, returning every frame that became complete
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<Vec<Bytes>, CodecError> {
        self.rate.raw_bytes += (samples.len() * std::mem::size_of::<i16>()) as u64;
        self.pending.extend_from_slice(samples);

        let frame_len = self.encoder.samples_per_frame();
        let mut frames = Vec::with_capacity(self.pending.len() / frame_len);
        let mut consumed = 0;
        let mut result = Ok(());
        while self.pending.len() - consumed >= frame_len {
            let encoded = self
                .encoder
                .encode(&self.pending[consumed..consumed + frame_len]);
            // A failed frame is consumed too
            consumed += frame_len;
            match encoded {
                Ok(encoded) => {
                    self.record(&encoded);
                    frames.push(encoded);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.pending.drain(..consumed);
        result.map(|_| frames)
    }

    /// Encode any remaining partial frame, zero-padded to full length
    pub fn flush(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        self.pending.resize(self.encoder.samples_per_frame(), 0.0);
        let encoded = self.encoder.encode(&self.pending)?;
        self.pending.clear();
        self.record(&encoded);
        Ok(Some(encoded))
    }

    fn record(&mut self, encoded: &Bytes) {
        self.rate.encoded_bytes += encoded.len() as u64;
        self.rate.frames += 1;
        self.frames_encoded += 1;
    }

    /// Samples waiting for a complete frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Return and reset the throughput counters
    pub fn take_rate(&mut self) -> EncodeRate {
        std::mem::take(&mut self.rate)
    }
}
