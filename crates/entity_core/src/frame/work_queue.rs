//! Bounded MPSC queue with blocking pop
//!
//! A ring of capacity 2^k − 1 hands frame orchestrators to the helper
//! thread. Producers get a non-blocking `push` that reports a full queue;
//! the single consumer parks on a condition variable until an element
//! arrives or the queue is closed.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer single-consumer queue.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` elements; the capacity must
    /// be a power of two minus one.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && (capacity + 1).is_power_of_two(),
            "capacity must be a power of two minus one"
        );
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Insert an element; returns `false` when the queue is full or closed.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.items.len() >= self.capacity {
            return false;
        }
        let was_empty = inner.items.is_empty();
        inner.items.push_back(item);
        drop(inner);
        if was_empty {
            self.available.notify_one();
        }
        true
    }

    /// Extract the next element, blocking until one arrives. Returns `None`
    /// once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Non-blocking extraction.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// True when no element is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake the consumer so it re-checks for work.
    pub fn flush(&self) {
        self.available.notify_one();
    }

    /// Refuse further pushes and unblock the consumer; queued elements can
    /// still be drained.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.available.notify_all();
    }

    /// True once [`WorkQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_capacity_bound() {
        let queue = WorkQueue::new(7);
        for i in 0..7 {
            assert!(queue.push(i));
        }
        assert!(!queue.push(7));
        assert_eq!(queue.len(), 7);
    }

    #[test]
    #[should_panic]
    fn test_capacity_must_be_power_of_two_minus_one() {
        let _ = WorkQueue::<i32>::new(6);
    }

    #[test]
    fn test_fifo_order_and_accounting() {
        let queue = WorkQueue::new(15);
        let mut pushed = 0usize;
        for i in 0..10 {
            assert!(queue.push(i));
            pushed += 1;
        }
        let mut popped = 0usize;
        for expected in 0..10 {
            assert_eq!(queue.try_pop(), Some(expected));
            popped += 1;
        }
        assert_eq!(queue.try_pop(), None);
        assert_eq!(pushed - popped, queue.len());
    }

    #[test]
    fn test_close_unblocks_consumer() {
        let queue = Arc::new(WorkQueue::<u32>::new(7));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert!(!queue.push(1));
    }

    #[test]
    fn test_cross_thread_delivery_never_drops() {
        let queue = Arc::new(WorkQueue::new(7));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut received = Vec::new();
                while let Some(v) = queue.pop() {
                    received.push(v);
                }
                received
            })
        };
        let mut sent = 0u32;
        for i in 0..1000u32 {
            while !queue.push(i) {
                std::thread::sleep(std::time::Duration::from_micros(100));
            }
            sent += 1;
        }
        // Let the consumer drain before closing
        while !queue.is_empty() {
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
        queue.close();
        let received = consumer.join().unwrap();
        assert_eq!(received.len() as u32, sent);
        assert!(received.windows(2).all(|w| w[0] < w[1]));
    }
}
