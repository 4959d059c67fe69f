//! Audio Sender Application
//!
//! Captures the default (or configured) input device, encodes it into
//! fixed-duration Opus frames and streams them to every connected receiver.
//!
//! Usage: `sender [bind_port]`

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_relay::{
    audio::{
        capture::{pump, AudioCapture, PumpEnd},
        device::list_devices,
    },
    codec::{FrameEncoder, OpusEncoder},
    config::AppConfig,
    network::Broadcaster,
};

/// Captured blocks buffered between the audio thread and the encoder
const CAPTURE_BACKLOG: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Audio Sender");

    let mut config = AppConfig::load_or_default().context("Failed to load configuration")?;
    if let Some(port) = std::env::args().nth(1) {
        config.network.port = port
            .parse()
            .with_context(|| format!("Invalid port: {}", port))?;
    }
    config.validate().context("Invalid configuration")?;

    // List available input devices
    println!("\n=== Available Input Devices ===");
    for device in list_devices().iter().filter(|d| d.is_input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let encoder = OpusEncoder::new(&config.stream, &config.encoder)
        .context("Failed to create Opus encoder")?;
    tracing::info!(
        "Opus encoder initialized: {}Hz, {} channels, {} samples/frame ({:.1}ms)",
        config.stream.sample_rate,
        config.stream.channels,
        encoder.frame_size(),
        config.stream.frame_duration_ms
    );
    let mut frames = FrameEncoder::new(encoder);

    let broadcaster = Broadcaster::new(
        config.network.framing,
        config.network.max_frame_size,
        config.network.client_backlog,
    );
    let listener = Broadcaster::bind(&config.network.bind_endpoint())
        .await
        .context("Failed to bind stream listener")?;

    let cancel = CancellationToken::new();
    let server = {
        let broadcaster = broadcaster.clone();
        let cancel = cancel.clone();
        let nodelay = config.network.nodelay;
        tokio::spawn(async move { broadcaster.serve(listener, nodelay, cancel).await })
    };

    let (block_tx, block_rx) = bounded::<Vec<f32>>(CAPTURE_BACKLOG);
    let mut capture = AudioCapture::new(
        config.capture.device_id.as_deref(),
        config.stream.sample_rate,
        config.stream.channels,
    );
    capture.start(block_tx).context("Failed to start audio capture")?;
    tracing::info!("Audio capture started - press Ctrl+C to stop");

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Stopping...");
            ctrl_c.cancel();
        }
    });

    // Encoding runs on a blocking thread fed by the capture channel
    let encode_cancel = cancel.clone();
    let encode_broadcaster = broadcaster.clone();
    let capture_errors = capture.errors();
    let encode_task = tokio::task::spawn_blocking(move || {
        let mut last_report = Instant::now();

        let pumped = pump(
            &block_rx,
            &capture_errors,
            &encode_cancel,
            Duration::from_millis(100),
            |block| {
                match frames.push_samples(&block) {
                    Ok(encoded) => {
                        for payload in encoded {
                            if let Err(e) = encode_broadcaster.publish(payload) {
                                tracing::warn!("Failed to publish frame: {}", e);
                            }
                        }
                    }
                    Err(e) => tracing::warn!("Encoding failed: {}", e),
                }

                // Bytes/sec, once per second
                let elapsed = last_report.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    let rate = frames.take_rate();
                    let secs = elapsed.as_secs_f64();
                    tracing::info!(
                        "{:.0} frames/s, raw {:.1} KB/s, encoded {:.1} KB/s, {} clients",
                        rate.frames as f64 / secs,
                        rate.raw_bytes as f64 / 1024.0 / secs,
                        rate.encoded_bytes as f64 / 1024.0 / secs,
                        encode_broadcaster.client_count()
                    );
                    last_report = Instant::now();
                }
            },
        );

        match frames.flush() {
            Ok(Some(tail)) => {
                if let Err(e) = encode_broadcaster.publish(tail) {
                    tracing::warn!("Failed to publish final frame: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to encode final frame: {}", e),
        }
        (pumped, frames.frames_encoded())
    });

    let (pumped, frames_encoded) = encode_task.await.context("Encoder thread failed")?;
    cancel.cancel();
    capture.stop();
    tracing::info!(
        "Sent {} frames, {} capture blocks dropped",
        frames_encoded,
        capture.blocks_dropped()
    );

    server
        .await
        .context("Stream server task failed")?
        .context("Stream server failed")?;

    match pumped.context("Audio capture failed")? {
        PumpEnd::Cancelled => {}
        PumpEnd::CaptureClosed => tracing::warn!("Capture stopped delivering audio"),
    }
    Ok(())
}
