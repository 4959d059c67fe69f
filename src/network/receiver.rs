//! Stream receiver
//!
//! Turns delimited payloads into `EncodedFrame`s numbered in arrival order
//! and hands them to the frame queue. Whatever the transport has ready at
//! one wake-up is pushed as a single batch.

use bytes::Bytes;
use futures_util::{FutureExt, Stream, StreamExt};
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::audio::buffer::FrameQueue;
use crate::audio::frame::EncodedFrame;
use crate::error::NetworkError;

/// Upper bound on frames collected per wake-up
const MAX_BATCH: usize = 16;

/// Why the receive loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// Transport signalled end of stream
    EndOfStream,
    /// Stop was requested
    Cancelled,
}

/// Receiver statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub frames_received: u64,
    pub bytes_received: u64,
    /// Zero-length reads that were not turned into frames
    pub empty_chunks: u64,
    /// Older frames pushed out of a full queue
    pub frames_evicted: u64,
}

/// Delimited payloads in, sequenced frames out
pub struct StreamReceiver {
    frame_duration: Duration,
    next_sequence: u64,
    stats: ReceiverStats,
}

impl StreamReceiver {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            next_sequence: 0,
            stats: ReceiverStats::default(),
        }
    }

    /// Wrap one payload as the next frame. Empty payloads carry no frame.
    pub fn on_receive(&mut self, bytes: Bytes) -> Option<EncodedFrame> {
        if bytes.is_empty() {
            self.stats.empty_chunks += 1;
            return None;
        }

        self.stats.frames_received += 1;
        self.stats.bytes_received += bytes.len() as u64;

        let frame = EncodedFrame::new(bytes, self.next_sequence, self.frame_duration);
        self.next_sequence += 1;
        Some(frame)
    }

    /// Read frames into `queue` until the stream ends, fails, or `cancel` fires.
    ///
    /// Transport errors are returned as-is; reconnecting is up to the caller.
    pub async fn run<S>(
        &mut self,
        mut stream: S,
        queue: &FrameQueue<EncodedFrame>,
        cancel: &CancellationToken,
    ) -> Result<ReceiveEnd, NetworkError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => return Ok(ReceiveEnd::Cancelled),
                item = stream.next() => item,
            };

            let mut batch = Vec::with_capacity(MAX_BATCH);
            let mut ended = false;
            let mut failure = None;

            let mut next = first;
            loop {
                match next {
                    Some(Ok(bytes)) => {
                        if let Some(frame) = self.on_receive(bytes) {
                            batch.push(frame);
                        }
                    }
                    Some(Err(e)) => {
                        failure = Some(NetworkError::ReceiveFailed(e.to_string()));
                        break;
                    }
                    None => {
                        ended = true;
                        break;
                    }
                }
                if batch.len() >= MAX_BATCH {
                    break;
                }
                // Take whatever else is already buffered without waiting
                match stream.next().now_or_never() {
                    Some(item) => next = item,
                    None => break,
                }
            }

            self.deliver(batch, queue);

            if let Some(e) = failure {
                tracing::error!("Transport error after {} frames: {}", self.next_sequence, e);
                return Err(e);
            }
            if ended {
                tracing::info!("Stream closed after {} frames", self.next_sequence);
                return Ok(ReceiveEnd::EndOfStream);
            }
        }
    }

    fn deliver(&mut self, batch: Vec<EncodedFrame>, queue: &FrameQueue<EncodedFrame>) {
        let evicted = match batch.len() {
            0 => 0,
            1 => batch
                .into_iter()
                .next()
                .map_or(0, |frame| usize::from(!queue.push(frame))),
            _ => queue.push_bulk(batch),
        };

        if evicted > 0 {
            self.stats.frames_evicted += evicted as u64;
            tracing::warn!(
                "Frame queue full, {} oldest frames dropped ({} total)",
                evicted,
                self.stats.frames_evicted
            );
        }
    }

    /// Sequence index the next frame will get
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::FrameQueue;
    use futures_util::stream;

    const FIVE_MS: Duration = Duration::from_millis(5);

    fn chunks(items: Vec<io::Result<Bytes>>) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        stream::iter(items)
    }

    #[test]
    fn test_sequence_and_timestamp() {
        let mut receiver = StreamReceiver::new(FIVE_MS);

        let a = receiver.on_receive(Bytes::from_static(b"a")).unwrap();
        assert!(receiver.on_receive(Bytes::new()).is_none());
        let b = receiver.on_receive(Bytes::from_static(b"bb")).unwrap();

        assert_eq!((a.sequence, b.sequence), (0, 1));
        assert_eq!(b.timestamp(), FIVE_MS);
        assert_eq!(b.duration, FIVE_MS);

        let stats = receiver.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.bytes_received, 3);
        assert_eq!(stats.empty_chunks, 1);
    }

    #[tokio::test]
    async fn test_run_until_end_of_stream() {
        let queue = FrameQueue::new(64);
        let mut receiver = StreamReceiver::new(FIVE_MS);
        let items = (0..20u8).map(|i| Ok(Bytes::from(vec![i]))).collect();

        let end = receiver
            .run(chunks(items), &queue, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(end, ReceiveEnd::EndOfStream);
        let frames = queue.pop_bulk(64);
        assert_eq!(frames.len(), 20);
        assert!(frames.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
        assert_eq!(frames[19].payload, Bytes::from(vec![19u8]));
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal() {
        let queue = FrameQueue::new(8);
        let mut receiver = StreamReceiver::new(FIVE_MS);
        let items = vec![
            Ok(Bytes::from_static(b"a")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"never")),
        ];

        let result = receiver
            .run(chunks(items), &queue, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(NetworkError::ReceiveFailed(_))));
        // Frames read before the error are kept
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_read() {
        let queue = FrameQueue::new(8);
        let mut receiver = StreamReceiver::new(FIVE_MS);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let end = receiver
            .run(stream::pending::<io::Result<Bytes>>(), &queue, &cancel)
            .await
            .unwrap();
        assert_eq!(end, ReceiveEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_overflow_counts_evictions() {
        let queue = FrameQueue::new(4);
        let mut receiver = StreamReceiver::new(FIVE_MS);
        let items = (0..10u8).map(|i| Ok(Bytes::from(vec![i]))).collect();

        receiver
            .run(chunks(items), &queue, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receiver.stats().frames_evicted, 6);
        let kept: Vec<u64> = queue.pop_bulk(4).iter().map(|f| f.sequence).collect();
        assert_eq!(kept, vec![6, 7, 8, 9]);
    }
}
