//! Fixed-capacity FIFO shared between caller threads and the worker.
//!
//! A plain ring over `capacity + 1` slots guarded by a mutex; `push`
//! refuses instead of blocking when the ring is full, so neither side can
//! stall the other.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default number of entries a queue holds before refusing pushes.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub(crate) struct Queue<T> {
    inner: Mutex<Ring<T>>,
}

struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                items: VecDeque::with_capacity(capacity + 1),
                capacity,
            }),
        }
    }

    /// Enqueue an item, handing it back when the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut ring = self.inner.lock();
        if ring.items.len() >= ring.capacity {
            return Err(item);
        }
        ring.items.push_back(item);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = Queue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn refuses_when_full() {
        let queue = Queue::new(2);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.push(3), Err(3));
        queue.pop();
        queue.push(3).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn clear_empties_everything() {
        let queue = Queue::new(8);
        for i in 0..8 {
            queue.push(i).unwrap();
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn shared_between_threads() {
        use std::sync::Arc;

        let queue = Arc::new(Queue::new(DEFAULT_QUEUE_CAPACITY));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    while queue.push(i).is_err() {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 100 {
            if let Some(item) = queue.pop() {
                received.push(item);
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }
}
