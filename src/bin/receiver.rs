//! Audio Receiver Application
//!
//! Connects to a sender and plays its stream through the jitter buffer.
//!
//! Usage: `receiver [server_address[:port]]`

use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_relay::{
    audio::{device::list_devices, output::CpalOutput},
    codec::OpusDecoder,
    config::AppConfig,
    network,
    session::{Session, SessionConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Audio Receiver");

    let mut config = AppConfig::load_or_default().context("Failed to load configuration")?;

    // Server address from args, optionally with a port
    if let Some(arg) = std::env::args().nth(1) {
        match arg.rsplit_once(':') {
            Some((host, port)) => {
                config.network.server_address = host.to_string();
                config.network.port = port
                    .parse()
                    .with_context(|| format!("Invalid port in {}", arg))?;
            }
            None => config.network.server_address = arg,
        }
    }
    config.validate().context("Invalid configuration")?;

    // List available output devices
    println!("\n=== Available Output Devices ===");
    for device in list_devices().iter().filter(|d| d.is_output) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let output = CpalOutput::open(
        config.output.device_id.as_deref(),
        config.stream.sample_rate,
        config.output.queue_capacity,
    )
    .context("Failed to open output device")?;

    let monitor = output.monitor();

    let endpoint = config.network.server_endpoint();
    let transport = network::connect(
        &endpoint,
        config.network.framing,
        config.network.max_frame_size,
        config.network.nodelay,
    )
    .await
    .with_context(|| format!("Failed to connect to {}", endpoint))?;

    // Configured by the session from the stream settings
    let session = Session::new(SessionConfig::from_app(&config), OpusDecoder::new(), output);
    let handle = session.handle();

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Stopping...");
            ctrl_c.stop();
        }
    });

    // Periodic stats
    let stats = handle.clone();
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.tick().await;
        loop {
            interval.tick().await;
            let queue = stats.queue_stats();
            let played = monitor.stats();
            tracing::info!(
                "Session {:?}: queue {}/{} ({:.0}%), {} frames in, {} evicted; output {} played, {} late, {} silent samples",
                stats.status(),
                queue.len,
                queue.capacity,
                queue.fill_level() * 100.0,
                queue.pushed,
                queue.evicted,
                played.frames_played,
                played.frames_late,
                played.silent_samples
            );
        }
    });

    let result = session.run(transport).await;
    stats_task.abort();

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure.report)?);
            Err(failure.error).context("Session failed")
        }
    }
}
