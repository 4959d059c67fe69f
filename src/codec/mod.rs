//! Opus codec wrappers
//!
//! The receiving side only sees the `FrameDecoder` capability; the sending
//! side encodes captured audio into fixed-duration frames.

pub mod decoder;
pub mod encoder;

pub use decoder::{DecodeAdapter, DecodeStats, DecoderState, FrameDecoder, OpusDecoder};
pub use encoder::{FrameEncoder, OpusEncoder};
