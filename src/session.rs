//! Playback session
//!
//! A session joins one transport to one decoder and one output device
//! through the jitter buffer. It runs two tasks:
//!
//! - the receiver task reads the transport and fills the frame queue;
//! - the playout task primes the queue, decodes frames in order and hands
//!   them to the scheduler, which it owns outright.
//!
//! Teardown always runs in the same order: stop the receiver, flush the
//! decoder, stop the scheduler (releasing unplayed audio), close the device.
//! On a clean end of stream everything already buffered is played first; on
//! stop or a fatal error buffered frames are abandoned.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::audio::buffer::{create_frame_queue, QueueStats, SharedFrameQueue};
use crate::audio::frame::EncodedFrame;
use crate::audio::output::AudioOutput;
use crate::audio::scheduler::{PlaybackScheduler, SchedulerStats};
use crate::codec::decoder::{DecodeAdapter, DecodeStats, DecoderState, FrameDecoder};
use crate::config::AppConfig;
use crate::error::{AudioError, Error, NetworkError};
use crate::network::framing::FrameStream;
use crate::network::receiver::{ReceiverStats, StreamReceiver};

/// Session parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: Duration,
    /// Frame queue capacity
    pub capacity: usize,
    /// Frames to buffer before playout starts or resumes after running dry
    pub lookahead: usize,
    pub safety_margin: Duration,
}

impl SessionConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            codec: config.stream.codec.clone(),
            sample_rate: config.stream.sample_rate,
            channels: config.stream.channels,
            frame_duration: config.stream.frame_duration(),
            capacity: config.jitter.capacity,
            lookahead: config.jitter.lookahead,
            safety_margin: config.jitter.safety_margin(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// User-visible session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    /// Waiting for the queue to reach the lookahead
    Buffering,
    Playing,
    /// Stream ended and all buffered audio was played
    Ended,
    Stopped,
    Failed(String),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Stopped | Self::Failed(_))
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    EndOfStream,
    Stopped,
    Failed,
}

/// Summary written when a session finishes
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end: SessionEnd,
    pub error: Option<String>,

    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_evicted: u64,

    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub dropped_unready: u64,
    pub out_of_order: u64,

    pub frames_scheduled: u64,
    pub schedule_failures: u64,
    pub resyncs: u64,
    /// Times playout ran dry and had to re-prime
    pub underruns: u64,
    /// Frames still queued when the session was torn down
    pub frames_abandoned: usize,
    pub scheduled_span_ms: f64,
}

impl SessionReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ended_at: started_at,
            end: SessionEnd::EndOfStream,
            error: None,
            frames_received: 0,
            bytes_received: 0,
            frames_evicted: 0,
            frames_decoded: 0,
            decode_failures: 0,
            dropped_unready: 0,
            out_of_order: 0,
            frames_scheduled: 0,
            schedule_failures: 0,
            resyncs: 0,
            underruns: 0,
            frames_abandoned: 0,
            scheduled_span_ms: 0.0,
        }
    }

    fn record_receiver(&mut self, stats: ReceiverStats) {
        self.frames_received = stats.frames_received;
        self.bytes_received = stats.bytes_received;
        self.frames_evicted = stats.frames_evicted;
    }

    fn record_decoder(&mut self, stats: DecodeStats) {
        self.frames_decoded = stats.frames_decoded;
        self.decode_failures = stats.decode_failures;
        self.dropped_unready = stats.dropped_unready;
        self.out_of_order = stats.out_of_order;
    }

    fn record_scheduler(&mut self, stats: SchedulerStats) {
        self.frames_scheduled = stats.frames_scheduled;
        self.resyncs = stats.resyncs;
        self.scheduled_span_ms = stats.scheduled_span().as_secs_f64() * 1000.0;
    }

    fn finish(&mut self, outcome: &Result<SessionEnd, Error>) {
        self.ended_at = Utc::now();
        match outcome {
            Ok(end) => self.end = *end,
            Err(e) => {
                self.end = SessionEnd::Failed;
                self.error = Some(e.to_string());
            }
        }
    }
}

/// A session that ended on a fatal error
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SessionFailure {
    pub error: Error,
    pub report: SessionReport,
}

/// Control and observation from outside the session
#[derive(Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
    status: watch::Receiver<SessionStatus>,
    queue: SharedFrameQueue<EncodedFrame>,
}

impl SessionHandle {
    /// Request teardown. Buffered frames are abandoned.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Status updates as they happen
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

/// One playback session
pub struct Session<D, O> {
    config: SessionConfig,
    decoder: D,
    output: O,
    queue: SharedFrameQueue<EncodedFrame>,
    status: Arc<watch::Sender<SessionStatus>>,
    cancel: CancellationToken,
}

impl<D, O> Session<D, O>
where
    D: FrameDecoder + 'static,
    O: AudioOutput + 'static,
{
    pub fn new(config: SessionConfig, decoder: D, output: O) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            queue: create_frame_queue(config.capacity),
            config,
            decoder,
            output,
            status: Arc::new(status),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
            status: self.status.subscribe(),
            queue: self.queue.clone(),
        }
    }

    /// Play `transport` until it ends, the session is stopped, or a fatal
    /// error occurs. A stop is not a failure.
    pub async fn run(self, transport: FrameStream) -> Result<SessionReport, SessionFailure> {
        let Session {
            config,
            mut decoder,
            mut output,
            queue,
            status,
            cancel,
        } = self;
        let mut report = SessionReport::new(Utc::now());

        if decoder.state() == DecoderState::Unconfigured {
            if let Err(e) = decoder.configure(&config.codec, config.sample_rate, config.channels) {
                decoder.close();
                output.close();
                let outcome = Err(Error::from(e));
                report.finish(&outcome);
                return Err(conclude(&status, outcome, report));
            }
        }

        tracing::info!(
            "Session starting: {} {}Hz {}ch, {:?} frames, queue {}, lookahead {}",
            config.codec,
            config.sample_rate,
            config.channels,
            config.frame_duration,
            config.capacity,
            config.lookahead
        );
        set_status(&status, SessionStatus::Buffering);

        // Child of the user token: cancelled on stop or on any fatal error
        let abort = cancel.child_token();

        let receiver_task = {
            let queue = queue.clone();
            let abort = abort.clone();
            let frame_duration = config.frame_duration;
            tokio::spawn(async move {
                let mut receiver = StreamReceiver::new(frame_duration);
                let result = receiver.run(transport, &queue, &abort).await;
                queue.close();
                if result.is_err() {
                    abort.cancel();
                }
                (receiver.stats(), result)
            })
        };

        let mut playout = Playout {
            queue: queue.clone(),
            adapter: DecodeAdapter::new(decoder),
            scheduler: PlaybackScheduler::new(output, config.safety_margin),
            lookahead: config.lookahead,
            safety_margin: config.safety_margin,
            primed: false,
            schedule_failures: 0,
            underruns: 0,
            status: status.clone(),
        };
        let playout_task = {
            let abort = abort.clone();
            tokio::spawn(async move {
                let result = playout.run(&abort).await;
                (playout, result)
            })
        };

        let joined = playout_task.await;

        // Stop the receiver
        abort.cancel();
        let (receiver_stats, receive_result) = match receiver_task.await {
            Ok(done) => done,
            Err(e) => (
                ReceiverStats::default(),
                Err(NetworkError::ReceiveFailed(format!("receiver task failed: {}", e))),
            ),
        };
        report.record_receiver(receiver_stats);
        report.frames_abandoned = queue.clear();

        let (playout, playout_result) = match joined {
            Ok(done) => done,
            Err(e) => {
                let outcome = Err(Error::Session(format!("playout task failed: {}", e)));
                report.finish(&outcome);
                return Err(conclude(&status, outcome, report));
            }
        };

        let Playout {
            mut adapter,
            scheduler,
            schedule_failures,
            underruns,
            ..
        } = playout;

        adapter.flush();
        let (output, scheduler_stats) = scheduler.stop();
        drop(output);
        let (_, decode_stats) = adapter.close();

        report.record_decoder(decode_stats);
        report.record_scheduler(scheduler_stats);
        report.schedule_failures = schedule_failures;
        report.underruns = underruns;

        let outcome = match (playout_result, receive_result) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(Error::from(e)),
            (Ok(PlayoutEnd::Drained), Ok(_)) => Ok(SessionEnd::EndOfStream),
            (Ok(PlayoutEnd::Aborted), Ok(_)) => Ok(SessionEnd::Stopped),
        };
        report.finish(&outcome);

        tracing::info!(
            "Session finished ({:?}): {} received, {} decoded, {} scheduled, {} resyncs, {} underruns, {:.1}ms scheduled",
            report.end,
            report.frames_received,
            report.frames_decoded,
            report.frames_scheduled,
            report.resyncs,
            report.underruns,
            report.scheduled_span_ms
        );

        match outcome {
            Ok(_) => {
                conclude_ok(&status, &report);
                Ok(report)
            }
            Err(e) => Err(conclude(&status, Err(e), report)),
        }
    }
}

fn set_status(status: &watch::Sender<SessionStatus>, next: SessionStatus) {
    status.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

fn conclude_ok(status: &watch::Sender<SessionStatus>, report: &SessionReport) {
    let next = match report.end {
        SessionEnd::Stopped => SessionStatus::Stopped,
        _ => SessionStatus::Ended,
    };
    set_status(status, next);
}

fn conclude(
    status: &watch::Sender<SessionStatus>,
    outcome: Result<SessionEnd, Error>,
    report: SessionReport,
) -> SessionFailure {
    let error = match outcome {
        Err(e) => e,
        Ok(end) => Error::Session(format!("unexpected end {:?}", end)),
    };
    tracing::error!("Session failed: {}", error);
    set_status(status, SessionStatus::Failed(error.to_string()));
    SessionFailure { error, report }
}

/// Device errors the session survives by skipping the frame
fn is_transient(err: &AudioError) -> bool {
    matches!(err, AudioError::QueueFull(_) | AudioError::UnsupportedFormat(_))
}

enum PlayoutEnd {
    Drained,
    Aborted,
}

enum Wake {
    Abort,
    Frames,
    Dry,
}

/// Consumer side: queue → decoder → scheduler
struct Playout<D, O> {
    queue: SharedFrameQueue<EncodedFrame>,
    adapter: DecodeAdapter<D>,
    scheduler: PlaybackScheduler<O>,
    lookahead: usize,
    safety_margin: Duration,
    /// Lookahead reached; cleared when scheduled audio runs out
    primed: bool,
    schedule_failures: u64,
    underruns: u64,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl<D: FrameDecoder, O: AudioOutput> Playout<D, O> {
    async fn run(&mut self, abort: &CancellationToken) -> Result<PlayoutEnd, Error> {
        loop {
            if self.queue.is_closed() && self.queue.is_empty() {
                play_out(self.scheduler.buffered_ahead(), abort).await;
                return Ok(PlayoutEnd::Drained);
            }

            let primed = self.primed;
            let want = if primed { 1 } else { self.lookahead.max(1) };
            // Scheduled audio runs out at the cursor; allow one margin past it
            let dry_in = self.scheduler.buffered_ahead() + self.safety_margin;
            let queue = self.queue.clone();

            let wake = tokio::select! {
                biased;
                _ = abort.cancelled() => Wake::Abort,
                _ = queue.wait_for(want) => Wake::Frames,
                _ = tokio::time::sleep(dry_in), if primed => Wake::Dry,
            };

            match wake {
                Wake::Abort => return Ok(PlayoutEnd::Aborted),
                Wake::Dry => {
                    self.underrun();
                    continue;
                }
                Wake::Frames => {}
            }

            if !self.primed {
                self.prime();
            }

            while let Some(frame) = self.queue.pop() {
                if abort.is_cancelled() {
                    return Ok(PlayoutEnd::Aborted);
                }
                self.play(frame)?;
            }
        }
    }

    fn prime(&mut self) {
        let buffered = self.queue.len();
        if self.scheduler.stats().frames_scheduled == 0 && self.underruns == 0 {
            self.scheduler.start();
            tracing::info!("Playout primed with {} frames", buffered);
        } else {
            tracing::info!("Playout resumed with {} frames", buffered);
        }
        self.primed = true;
        set_status(&self.status, SessionStatus::Playing);
    }

    fn underrun(&mut self) {
        self.primed = false;
        self.underruns += 1;
        tracing::warn!(
            "Playout ran dry ({} underruns), re-buffering {} frames",
            self.underruns,
            self.lookahead
        );
        set_status(&self.status, SessionStatus::Buffering);
    }

    fn play(&mut self, frame: EncodedFrame) -> Result<(), Error> {
        let decoded = match self.adapter.decode(frame)? {
            Some(decoded) => decoded,
            None => return Ok(()),
        };

        match self.scheduler.schedule(decoded) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => {
                self.schedule_failures += 1;
                tracing::warn!("Output rejected frame: {}. Skipping frame.", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Let the device finish what is already scheduled
async fn play_out(remaining: Duration, abort: &CancellationToken) {
    if remaining.is_zero() {
        return;
    }
    tracing::debug!("Draining {:?} of scheduled audio", remaining);
    tokio::select! {
        _ = abort.cancelled() => {}
        _ = tokio::time::sleep(remaining) => {}
    }
}
