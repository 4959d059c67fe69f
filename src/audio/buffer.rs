//! Fixed-capacity frame ring buffer
//!
//! `FrameRing` is a plain circular queue with overwrite-on-full semantics:
//! when the ring is full the oldest element is evicted to make room, so
//! overload drops old audio instead of adding latency.
//!
//! `FrameQueue` wraps a ring in a single critical section for the
//! producer/consumer pair of a session (network task pushes, playout task
//! pops) and wakes the consumer on every push.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Circular FIFO of fixed capacity
pub struct FrameRing<T> {
    slots: Box<[Option<T>]>,
    /// Index of the oldest element
    head: usize,
    len: usize,
}

impl<T> FrameRing<T> {
    /// Create an empty ring. A capacity of 0 is allowed; every push into
    /// such a ring is immediately evicted.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Free slots before the next push evicts
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Push an item, evicting and returning the oldest one if the ring is full
    pub fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Some(item);
        }

        if self.len == capacity {
            // Overwrite the oldest slot and advance head past it
            let evicted = self.slots[self.head].replace(item);
            self.head = (self.head + 1) % capacity;
            evicted
        } else {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(item);
            self.len += 1;
            None
        }
    }

    /// Push a batch as one operation.
    ///
    /// Final state equals pushing each item in order. Returns the number of
    /// elements evicted (older contents plus any leading items of the batch
    /// that could never fit).
    pub fn push_bulk<I>(&mut self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let mut items = items.into_iter();
        let capacity = self.capacity();
        let incoming = items.len();

        if incoming >= capacity {
            // Everything currently held goes, as do the leading surplus items
            let evicted = self.len + (incoming - capacity);
            self.clear();
            for _ in 0..incoming - capacity {
                items.next();
            }
            for item in items {
                let tail = self.len;
                self.slots[tail] = Some(item);
                self.len += 1;
            }
            return evicted;
        }

        let evicted = incoming.saturating_sub(self.free());
        for item in items {
            let _ = self.push(item);
        }
        evicted
    }

    /// Push a batch only if it fits without eviction. On overflow nothing is
    /// inserted and the batch is handed back.
    pub fn try_push_bulk(&mut self, items: Vec<T>) -> Result<(), Vec<T>> {
        if self.free() < items.len() {
            return Err(items);
        }
        for item in items {
            let _ = self.push(item);
        }
        Ok(())
    }

    /// Remove the oldest element
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    /// Remove up to `max` of the oldest elements
    pub fn pop_bulk(&mut self, max: usize) -> Vec<T> {
        let count = max.min(self.len);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(item) = self.pop() {
                out.push(item);
            }
        }
        out
    }

    /// Oldest element without removing it
    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    /// Oldest-to-newest traversal; does not affect pop order
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }

    /// Drop all elements, returning how many were held
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
        dropped
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FrameRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Ring shared between the network producer and the playout consumer
pub struct FrameQueue<T> {
    ring: Mutex<FrameRing<T>>,
    notify: Notify,
    closed: AtomicBool,
    pushed: AtomicU64,
    evicted: AtomicU64,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(FrameRing::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Push a frame and wake the consumer.
    /// Returns false if an older frame was evicted to make room.
    pub fn push(&self, item: T) -> bool {
        let evicted = self.ring.lock().push(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();

        match evicted {
            Some(_) => {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => true,
        }
    }

    /// Push a batch under a single lock. Returns the number of evicted frames.
    pub fn push_bulk(&self, items: Vec<T>) -> usize {
        let count = items.len() as u64;
        let evicted = self.ring.lock().push_bulk(items);
        self.pushed.fetch_add(count, Ordering::Relaxed);
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        self.notify.notify_one();
        evicted
    }

    /// Push a batch only if it fits entirely
    pub fn try_push_bulk(&self, items: Vec<T>) -> Result<(), Vec<T>> {
        let count = items.len() as u64;
        self.ring.lock().try_push_bulk(items)?;
        self.pushed.fetch_add(count, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.ring.lock().pop()
    }

    pub fn pop_bulk(&self, max: usize) -> Vec<T> {
        self.ring.lock().pop_bulk(max)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full()
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Drop everything buffered, returning how many frames were discarded
    pub fn clear(&self) -> usize {
        self.ring.lock().clear()
    }

    /// Mark the producer side finished and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until at least `min` frames are buffered (at least one), or the
    /// producer has closed the queue.
    pub async fn wait_for(&self, min: usize) {
        let min = min.max(1);
        loop {
            if self.len() >= min || self.is_closed() {
                return;
            }
            self.notify.notified().await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let ring = self.ring.lock();
        QueueStats {
            len: ring.len(),
            capacity: ring.capacity(),
            pushed: self.pushed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe handle to a frame queue
pub type SharedFrameQueue<T> = Arc<FrameQueue<T>>;

/// Create a new shared frame queue
pub fn create_frame_queue<T>(capacity: usize) -> SharedFrameQueue<T> {
    Arc::new(FrameQueue::new(capacity))
}

/// Frame queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub evicted: u64,
}

impl QueueStats {
    /// Fill level in 0.0..=1.0
    pub fn fill_level(&self) -> f32 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len as f32 / self.capacity as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn contents<T: Clone>(ring: &FrameRing<T>) -> Vec<T> {
        ring.iter().cloned().collect()
    }

    #[test]
    fn test_ring_basic() {
        let mut ring = FrameRing::with_capacity(4);

        assert!(ring.push(1).is_none());
        assert!(ring.push(2).is_none());
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.free(), 2);

        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut ring = FrameRing::with_capacity(3);
        for i in 1..=3 {
            ring.push(i);
        }
        assert!(ring.is_full());

        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.push(5), Some(2));
        assert_eq!(contents(&ring), vec![3, 4, 5]);
        assert_eq!(ring.pop(), Some(3));
    }

    #[test]
    fn test_iteration_is_non_destructive() {
        let mut ring = FrameRing::with_capacity(4);
        ring.push_bulk(vec![10, 20, 30]);

        assert_eq!(contents(&ring), vec![10, 20, 30]);
        assert_eq!(contents(&ring), vec![10, 20, 30]);
        assert_eq!(ring.peek(), Some(&10));
        assert_eq!(ring.pop_bulk(10), vec![10, 20, 30]);
    }

    #[test]
    fn test_push_bulk_wraps() {
        let mut ring = FrameRing::with_capacity(5);
        ring.push(1);
        ring.push(2);

        let evicted = ring.push_bulk(vec![3, 4, 5, 6]);
        assert_eq!(evicted, 1);
        assert_eq!(contents(&ring), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_push_bulk_larger_than_capacity() {
        let mut ring = FrameRing::with_capacity(3);
        ring.push(0);

        let evicted = ring.push_bulk(vec![1, 2, 3, 4, 5]);
        assert_eq!(evicted, 3);
        assert_eq!(contents(&ring), vec![3, 4, 5]);
        assert_eq!(ring.pop(), Some(3));
    }

    #[test]
    fn test_try_push_bulk_declines_overflow() {
        let mut ring = FrameRing::with_capacity(4);
        ring.push_bulk(vec![1, 2, 3]);

        let rejected = ring.try_push_bulk(vec![4, 5]);
        assert_eq!(rejected, Err(vec![4, 5]));
        assert_eq!(contents(&ring), vec![1, 2, 3]);

        assert!(ring.try_push_bulk(vec![4]).is_ok());
        assert!(ring.is_full());
    }

    #[test]
    fn test_zero_capacity() {
        let mut ring = FrameRing::with_capacity(0);
        assert_eq!(ring.push(1), Some(1));
        assert_eq!(ring.push_bulk(vec![1, 2]), 2);
        assert!(ring.is_empty());
        assert!(ring.is_full());
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_clear() {
        let mut ring = FrameRing::with_capacity(2);
        ring.push_bulk(vec![1, 2, 3]);
        assert_eq!(ring.clear(), 2);
        assert!(ring.is_empty());
        ring.push(9);
        assert_eq!(contents(&ring), vec![9]);
    }

    #[test]
    fn test_queue_counts_evictions() {
        let queue = FrameQueue::new(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.push_bulk(vec![4, 5]), 2);

        let stats = queue.stats();
        assert_eq!(stats.pushed, 5);
        assert_eq!(stats.evicted, 3);
        assert_eq!(stats.len, 2);
        assert!((stats.fill_level() - 1.0).abs() < f32::EPSILON);
        assert_eq!(queue.pop_bulk(4), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_push_and_close() {
        let queue = create_frame_queue::<u32>(8);

        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            producer.push(1);
            producer.push(2);
            producer.close();
        });

        queue.wait_for(2).await;
        handle.await.unwrap();
        assert!(queue.len() >= 2 || queue.is_closed());

        // Closed queue never blocks
        queue.clear();
        queue.wait_for(5).await;
        assert!(queue.is_closed());
    }

    proptest! {
        #[test]
        fn prop_len_bounded_and_keeps_latest(
            capacity in 0usize..16,
            items in proptest::collection::vec(any::<u16>(), 0..64),
        ) {
            let mut ring = FrameRing::with_capacity(capacity);
            for item in &items {
                ring.push(*item);
                prop_assert!(ring.len() <= capacity);
            }

            let keep = items.len().min(capacity);
            let expected: Vec<u16> = items[items.len() - keep..].to_vec();
            prop_assert_eq!(contents(&ring), expected);
        }

        #[test]
        fn prop_bulk_matches_repeated_push(
            capacity in 0usize..16,
            prefix in proptest::collection::vec(any::<u8>(), 0..20),
            batch in proptest::collection::vec(any::<u8>(), 0..40),
        ) {
            let mut single = FrameRing::with_capacity(capacity);
            let mut bulk = FrameRing::with_capacity(capacity);
            for item in &prefix {
                single.push(*item);
                bulk.push(*item);
            }

            let mut evicted_single = 0;
            for item in &batch {
                if single.push(*item).is_some() {
                    evicted_single += 1;
                }
            }
            let evicted_bulk = bulk.push_bulk(batch.clone());

            prop_assert_eq!(contents(&single), contents(&bulk));
            prop_assert_eq!(evicted_single, evicted_bulk);
            prop_assert_eq!(single.pop(), bulk.pop());
        }
    }
}
