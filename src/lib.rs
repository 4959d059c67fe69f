//! # LAN Audio Relay
//!
//! Low-latency audio relay: one sender captures and Opus-encodes audio in
//! 5 ms frames, any number of receivers rebuild a gapless, correctly paced
//! signal from the bursty network stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SENDER ────────────────────────────────┐
//! │  ┌─────────────┐    ┌──────────────────┐    ┌───────────────────────┐  │
//! │  │ cpal input  │───▶│  FrameEncoder    │───▶│  Broadcaster (TCP)    │  │
//! │  │ (capture)   │    │  5ms Opus frames │    │  one frame per write  │  │
//! │  └─────────────┘    └──────────────────┘    └───────────┬───────────┘  │
//! └─────────────────────────────────────────────────────────┼──────────────┘
//!                                                           │ byte stream
//! ┌──────────────────────────────── RECEIVER ───────────────┼──────────────┐
//! │                                                         ▼              │
//! │  ┌───────────────────┐   ┌─────────────┐   ┌────────────────────────┐  │
//! │  │ StreamReceiver    │──▶│ FrameQueue  │──▶│ DecodeAdapter (Opus)   │  │
//! │  │ (receiver task)   │   │ ring buffer │   │ (playout task)         │  │
//! │  └───────────────────┘   └─────────────┘   └───────────┬────────────┘  │
//! │                                                        ▼               │
//! │                                  ┌──────────────────────────────────┐  │
//! │                                  │ PlaybackScheduler (nextPlayTime) │  │
//! │                                  └───────────────┬──────────────────┘  │
//! │                                                  ▼                     │
//! │                                  ┌──────────────────────────────────┐  │
//! │                                  │ AudioOutput (cpal timeline)      │  │
//! │                                  └──────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod session;

#[cfg(test)]
pub(crate) mod testkit;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Codec both ends agree on
    pub const DEFAULT_CODEC: &str = "opus";

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 64_000;

    /// Default frame duration in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: f32 = 5.0;

    /// Default TCP port for the audio stream
    pub const DEFAULT_STREAM_PORT: u16 = 13345;

    /// Frames buffered before playout starts
    pub const DEFAULT_LOOKAHEAD_FRAMES: usize = 2;

    /// Lead over the device clock after an underrun, in milliseconds
    pub const DEFAULT_SAFETY_MARGIN_MS: f32 = 5.0;

    /// Largest encoded frame accepted from the wire
    pub const MAX_FRAME_SIZE: usize = 4000;

    /// Encoded frames held by the receive ring buffer
    pub const RING_BUFFER_CAPACITY: usize = 64;
}
