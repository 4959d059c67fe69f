//! Audio capture from an input device
//!
//! The cpal stream lives on its own thread; every callback block is copied
//! into a channel read by the encoder loop. A block that does not fit is
//! dropped and counted rather than blocking the audio thread.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::audio::device::{find_device, Direction};
use crate::error::AudioError;

/// Counters shared with the callback
#[derive(Default)]
struct CaptureCounters {
    live: AtomicBool,
    samples: AtomicU64,
    blocks_dropped: AtomicU64,
}

/// Captures interleaved f32 blocks from one input device
pub struct AudioCapture {
    /// `input:<name>`, default input if `None`
    device_id: Option<String>,
    config: cpal::StreamConfig,
    counters: Arc<CaptureCounters>,
    /// Dropping the sender ends the stream thread
    stop_tx: Option<Sender<()>>,
    stream_thread: Option<JoinHandle<()>>,
    error_tx: Sender<AudioError>,
    error_rx: Receiver<AudioError>,
}

impl AudioCapture {
    pub fn new(device_id: Option<&str>, sample_rate: u32, channels: u16) -> Self {
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        Self {
            device_id: device_id.map(str::to_string),
            config: cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            counters: Arc::new(CaptureCounters::default()),
            stop_tx: None,
            stream_thread: None,
            error_tx,
            error_rx,
        }
    }

    /// Open the device and start delivering blocks on `blocks`.
    ///
    /// Returns once the stream is playing, or with the error that kept it
    /// from starting.
    pub fn start(&mut self, blocks: Sender<Vec<f32>>) -> Result<(), AudioError> {
        if self.is_running() {
            return Ok(());
        }

        let device = find_device(self.device_id.as_deref(), Direction::Input)?;
        let error_tx = self.error_tx.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let config = self.config.clone();
        let counters = self.counters.clone();
        counters.samples.store(0, Ordering::Relaxed);

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let callback_counters = counters.clone();
                let built = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        callback_counters
                            .samples
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                        match blocks.try_send(data.to_vec()) {
                            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                            Err(TrySendError::Full(_)) => {
                                callback_counters
                                    .blocks_dropped
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match built {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }

                counters.live.store(true, Ordering::SeqCst);
                let _ = ready_tx.send(Ok(()));

                // Blocks until stop() drops the sender
                let _ = stop_rx.recv();
                drop(stream);
                counters.live.store(false, Ordering::SeqCst);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::StreamError("capture thread exited".into()));
            }
        }

        tracing::info!(
            "Capture stream open: {}Hz, {} channels",
            self.config.sample_rate.0,
            self.config.channels
        );
        self.stop_tx = Some(stop_tx);
        self.stream_thread = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop_tx = None;
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn samples_captured(&self) -> u64 {
        self.counters.samples.load(Ordering::Relaxed)
    }

    /// Blocks discarded because the encoder fell behind
    pub fn blocks_dropped(&self) -> u64 {
        self.counters.blocks_dropped.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Receiver for stream errors, for a consumer on another thread
    pub fn errors(&self) -> Receiver<AudioError> {
        self.error_rx.clone()
    }
}

/// Why `pump` returned without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    Cancelled,
    /// The capture side dropped its block sender
    CaptureClosed,
}

/// Hand captured blocks to `on_block` until `cancel` fires or capture ends.
///
/// A stream error is returned as soon as it is seen; blocks still queued
/// behind it are not delivered. Blocks the calling thread.
pub fn pump(
    blocks: &Receiver<Vec<f32>>,
    errors: &Receiver<AudioError>,
    cancel: &CancellationToken,
    poll: Duration,
    mut on_block: impl FnMut(Vec<f32>),
) -> Result<PumpEnd, AudioError> {
    while !cancel.is_cancelled() {
        if let Ok(err) = errors.try_recv() {
            tracing::error!("Capture stream failed: {}", err);
            return Err(err);
        }
        match blocks.recv_timeout(poll) {
            Ok(block) => on_block(block),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(PumpEnd::CaptureClosed),
        }
    }
    Ok(PumpEnd::Cancelled)
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
