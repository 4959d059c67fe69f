//! Decoder capability and the adapter that drives it
//!
//! `FrameDecoder` is the boundary to the codec library: it is configured
//! once for a codec, sample rate and channel count, reports whether it can
//! accept work, and turns one encoded frame into PCM. `DecodeAdapter` sits
//! in front of it and applies the per-frame error policy: unready decoder
//! or corrupt frame drops the frame, a closed decoder ends the session.

use opus::{Channels, Decoder};

use crate::audio::frame::{DecodedFrame, EncodedFrame};
use crate::error::CodecError;

/// Decoder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Unconfigured,
    Configured,
    Closed,
}

/// External decoder capability
pub trait FrameDecoder: Send {
    /// Configure for a fixed codec, sample rate and channel count
    fn configure(&mut self, codec: &str, sample_rate: u32, channels: u16)
        -> Result<(), CodecError>;

    fn state(&self) -> DecoderState;

    /// Decode one frame. `Ok(None)` means the frame produced no audio.
    fn decode(&mut self, frame: &EncodedFrame) -> Result<Option<DecodedFrame>, CodecError>;

    /// Discard internal state between streams
    fn flush(&mut self) -> Result<(), CodecError>;

    fn close(&mut self);
}

/// Opus decoder
pub struct OpusDecoder {
    decoder: Option<Decoder>,
    state: DecoderState,
    sample_rate: u32,
    channels: u16,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<f32>,
}

impl OpusDecoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            state: DecoderState::Unconfigured,
            sample_rate: 0,
            channels: 0,
            decode_buffer: Vec::new(),
        }
    }

    /// Create an already configured Opus decoder
    pub fn with_format(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let mut decoder = Self::new();
        decoder.configure("opus", sample_rate, channels)?;
        Ok(decoder)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl Default for OpusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for OpusDecoder {
    fn configure(
        &mut self,
        codec: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<(), CodecError> {
        if !codec.eq_ignore_ascii_case("opus") {
            return Err(CodecError::UnsupportedCodec(codec.to_string()));
        }
        if self.state == DecoderState::Closed {
            return Err(CodecError::DecoderClosed);
        }

        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // Largest Opus frame is 120ms
        self.decode_buffer = vec![0.0f32; sample_rate as usize * channels as usize * 120 / 1000];
        self.decoder = Some(decoder);
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.state = DecoderState::Configured;
        Ok(())
    }

    fn state(&self) -> DecoderState {
        self.state
    }

    fn decode(&mut self, frame: &EncodedFrame) -> Result<Option<DecodedFrame>, CodecError> {
        let decoder = match (self.state, self.decoder.as_mut()) {
            (DecoderState::Configured, Some(decoder)) => decoder,
            (DecoderState::Closed, _) => return Err(CodecError::DecoderClosed),
            _ => return Err(CodecError::DecodingFailed("decoder not configured".into())),
        };

        let samples = decoder
            .decode_float(&frame.payload, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        if samples == 0 {
            return Ok(None);
        }

        let total = samples * self.channels as usize;
        Ok(Some(DecodedFrame::new(
            self.decode_buffer[..total].to_vec(),
            self.channels,
            self.sample_rate,
            frame.sequence,
        )))
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder
                .reset_state()
                .map_err(|e| CodecError::DecoderInit(e.to_string())),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.decoder = None;
        self.state = DecoderState::Closed;
    }
}

/// Adapter statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub frames_submitted: u64,
    pub frames_decoded: u64,
    /// Frames that failed to decode and were skipped
    pub decode_failures: u64,
    /// Frames dropped because the decoder was not ready
    pub dropped_unready: u64,
    /// Frames that decoded to no audio
    pub empty_frames: u64,
    /// Frames arriving behind an already decoded sequence index
    pub out_of_order: u64,
}

/// Drives a `FrameDecoder` in sequence order with the per-frame error policy
pub struct DecodeAdapter<D> {
    decoder: D,
    last_sequence: Option<u64>,
    stats: DecodeStats,
}

impl<D: FrameDecoder> DecodeAdapter<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            last_sequence: None,
            stats: DecodeStats::default(),
        }
    }

    /// Decode one frame.
    ///
    /// Returns `Ok(None)` when the frame was dropped (decoder unready, decode
    /// failure, no audio, out of order). Only a closed decoder is an error.
    pub fn decode(&mut self, frame: EncodedFrame) -> Result<Option<DecodedFrame>, CodecError> {
        self.stats.frames_submitted += 1;

        match self.decoder.state() {
            DecoderState::Configured => {}
            DecoderState::Closed => return Err(CodecError::DecoderClosed),
            DecoderState::Unconfigured => {
                self.stats.dropped_unready += 1;
                tracing::warn!(
                    "Decoder not configured, dropping frame {}",
                    frame.sequence
                );
                return Ok(None);
            }
        }

        if let Some(last) = self.last_sequence {
            if frame.sequence <= last {
                self.stats.out_of_order += 1;
                tracing::debug!(
                    "Frame {} arrived after frame {}, dropping",
                    frame.sequence,
                    last
                );
                return Ok(None);
            }
        }
        self.last_sequence = Some(frame.sequence);

        match self.decoder.decode(&frame) {
            Ok(Some(decoded)) => {
                self.stats.frames_decoded += 1;
                Ok(Some(decoded))
            }
            Ok(None) => {
                self.stats.empty_frames += 1;
                tracing::debug!("Frame {} decoded to no samples", frame.sequence);
                Ok(None)
            }
            Err(CodecError::DecoderClosed) => Err(CodecError::DecoderClosed),
            Err(e) => {
                self.stats.decode_failures += 1;
                tracing::warn!(
                    "Decode error on frame {} ({} bytes): {}. Skipping frame.",
                    frame.sequence,
                    frame.len(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Reset decoder state and sequence tracking
    pub fn flush(&mut self) {
        if let Err(e) = self.decoder.flush() {
            tracing::warn!("Decoder flush failed: {}", e);
        }
        self.last_sequence = None;
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    /// Close the decoder and return it
    pub fn close(mut self) -> (D, DecodeStats) {
        self.decoder.close();
        (self.decoder, self.stats)
    }
}
