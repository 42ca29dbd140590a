use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why [`BoundedQueue::push`] refused an item. The item is handed back.
#[derive(Debug)]
pub(crate) enum PushError<T> {
    Full(T),
    Closed(T),
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity FIFO shared by many producers and one consumer.
pub(crate) struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(4_096)),
                closed: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Appends `item`, waiting up to `wait` for room. A zero `wait` never
    /// blocks.
    pub(crate) fn push(&self, item: T, wait: Duration) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            if wait.is_zero() || self.not_full.wait_until(&mut state, deadline).timed_out() {
                if state.items.len() < self.capacity && !state.closed {
                    continue;
                }
                return Err(PushError::Full(item));
            }
        }
    }

    /// Waits up to `timeout` for the first item, then takes up to `max`
    /// items without waiting further.
    ///
    /// Returns an empty batch on timeout, and `None` once the queue is
    /// closed and empty.
    pub(crate) fn pop_batch(&self, max: usize, timeout: Duration) -> Option<Vec<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.items.is_empty() {
            if state.closed {
                return None;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                if state.items.is_empty() {
                    return if state.closed { None } else { Some(Vec::new()) };
                }
                break;
            }
        }
        let take = max.max(1).min(state.items.len());
        let batch: Vec<T> = state.items.drain(..take).collect();
        self.not_full.notify_all();
        Some(batch)
    }

    /// Refuses further pushes and wakes every waiter. Queued items stay.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Removes and returns everything queued.
    pub(crate) fn drain_all(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let items = state.items.drain(..).collect();
        self.not_full.notify_all();
        items
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_when_full_without_waiting() {
        let queue = BoundedQueue::new(2);
        assert!(queue.push(1, Duration::ZERO).is_ok());
        assert!(queue.push(2, Duration::ZERO).is_ok());
        assert!(matches!(queue.push(3, Duration::ZERO), Err(PushError::Full(3))));
        assert_eq!(queue.pop_batch(10, Duration::ZERO), Some(vec![1, 2]));
    }

    #[test]
    fn blocked_push_proceeds_once_room_frees() {
        let queue = Arc::new(BoundedQueue::new(1));
        assert!(queue.push(1, Duration::ZERO).is_ok());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.pop_batch(1, Duration::from_secs(1))
            })
        };
        assert!(queue.push(2, Duration::from_secs(5)).is_ok());
        assert_eq!(consumer.join().ok().flatten(), Some(vec![1]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn closed_queue_drains_then_ends() {
        let queue = BoundedQueue::new(4);
        assert!(queue.push("a", Duration::ZERO).is_ok());
        queue.close();
        assert!(matches!(queue.push("b", Duration::ZERO), Err(PushError::Closed("b"))));
        assert_eq!(queue.pop_batch(4, Duration::from_millis(5)), Some(vec!["a"]));
        assert_eq!(queue.pop_batch(4, Duration::from_millis(5)), None);
    }

    #[test]
    fn pop_times_out_with_empty_batch() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        assert_eq!(queue.pop_batch(1, Duration::from_millis(5)), Some(Vec::new()));
    }
}
