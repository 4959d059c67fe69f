//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory, falling back
//! to defaults tuned for 5 ms Opus frames at 48 kHz mono.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::network::framing::Framing;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub jitter: JitterConfig,
    pub network: NetworkConfig,
    pub output: OutputConfig,
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
}

/// Format shared by both ends of the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            codec: DEFAULT_CODEC.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
        }
    }
}

impl StreamConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros((self.frame_duration_ms * 1000.0).round() as u64)
    }

    /// Samples per channel in one frame
    pub fn frame_size(&self) -> usize {
        (self.sample_rate as f32 * self.frame_duration_ms / 1000.0) as usize
    }
}

/// Receive-side buffering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Encoded frames held between the network and the decoder
    pub capacity: usize,
    /// Frames to accumulate before playout starts (0 disables priming)
    pub lookahead: usize,
    /// Lead added to the device clock when resynchronizing after an underrun
    pub safety_margin_ms: f32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            capacity: RING_BUFFER_CAPACITY,
            lookahead: DEFAULT_LOOKAHEAD_FRAMES,
            safety_margin_ms: DEFAULT_SAFETY_MARGIN_MS,
        }
    }
}

impl JitterConfig {
    pub fn safety_margin(&self) -> Duration {
        Duration::from_micros((self.safety_margin_ms * 1000.0).round() as u64)
    }
}

/// Transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the receiver connects to
    pub server_address: String,
    /// Address the sender listens on
    pub bind_address: String,
    pub port: u16,
    pub framing: Framing,
    pub max_frame_size: usize,
    pub nodelay: bool,
    /// Frames a slow client may fall behind before it starts skipping
    pub client_backlog: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_STREAM_PORT,
            framing: Framing::LengthPrefixed,
            max_frame_size: MAX_FRAME_SIZE,
            nodelay: true,
            client_backlog: 64,
        }
    }
}

impl NetworkConfig {
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.port)
    }

    pub fn bind_endpoint(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Playback device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Device id as reported by `list_devices` (`output:<name>`); default device if unset
    pub device_id: Option<String>,
    /// Decoded frames that may be scheduled ahead on the device
    pub queue_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            queue_capacity: 256,
        }
    }
}

/// Sender-side capture device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CaptureConfig {
    /// `input:<name>`; default input device if unset
    pub device_id: Option<String>,
}

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    Voip,
    Audio,
    LowDelay,
}

/// Sender-side encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub application: OpusApplication,
    pub bitrate: u32,
    pub complexity: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            application: OpusApplication::Audio,
            bitrate: DEFAULT_BITRATE,
            complexity: 10,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config directory, or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Write configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "lan-audio-relay", "lan-audio-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stream.codec != DEFAULT_CODEC {
            return Err(Error::Config(format!(
                "unsupported codec: {}",
                self.stream.codec
            )));
        }
        if !matches!(self.stream.channels, 1 | 2) {
            return Err(Error::Config(format!(
                "channels must be 1 or 2, got {}",
                self.stream.channels
            )));
        }
        if !matches!(self.stream.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(Error::Config(format!(
                "sample rate {} is not supported by opus",
                self.stream.sample_rate
            )));
        }
        // Opus frame durations
        let valid_durations = [2.5f32, 5.0, 10.0, 20.0, 40.0, 60.0];
        if !valid_durations
            .iter()
            .any(|d| (d - self.stream.frame_duration_ms).abs() < f32::EPSILON)
        {
            return Err(Error::Config(format!(
                "frame duration {}ms is not a valid opus frame size",
                self.stream.frame_duration_ms
            )));
        }
        if self.jitter.capacity == 0 {
            return Err(Error::Config("jitter capacity must be non-zero".into()));
        }
        if self.jitter.lookahead > self.jitter.capacity {
            return Err(Error::Config(format!(
                "lookahead {} exceeds jitter capacity {}",
                self.jitter.lookahead, self.jitter.capacity
            )));
        }
        if self.jitter.safety_margin_ms < 0.0 {
            return Err(Error::Config("safety margin must not be negative".into()));
        }
        if self.network.max_frame_size == 0 || self.network.max_frame_size > u16::MAX as usize {
            return Err(Error::Config(format!(
                "max frame size {} out of range",
                self.network.max_frame_size
            )));
        }
        Ok(())
    }
}
