//! Bounded queues with explicit drop policies.
//!
//! The frame queue runs `drop_oldest` so a stalled encoder sheds the
//! oldest frames instead of blocking the grabber; the segment queue runs
//! `block` so finished segments are never lost.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Evict the oldest queued item to admit the new one.
    DropOldest,
    /// Reject the new item.
    DropNewest,
    /// Block the producer until space frees up.
    Block,
}

impl DropPolicy {
    /// Configuration string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropPolicy::DropOldest => "drop_oldest",
            DropPolicy::DropNewest => "drop_newest",
            DropPolicy::Block => "block",
        }
    }
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item admitted without evictions.
    Accepted,
    /// Item admitted (or rejected) with `dropped` items lost.
    Dropped {
        /// Number of items lost by this push.
        dropped: usize,
        /// Whether the new item itself was admitted.
        accepted: bool,
    },
}

impl PushOutcome {
    /// Items lost by this push.
    pub fn dropped(&self) -> usize {
        match self {
            PushOutcome::Accepted => 0,
            PushOutcome::Dropped { dropped, .. } => *dropped,
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    dropped_total: u64,
}

/// Bounded MPSC-ish queue guarded by a mutex + condvars.
pub struct BoundedQueue<T> {
    capacity: usize,
    policy: DropPolicy,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// New queue with the given capacity (0 = unbounded) and policy.
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        BoundedQueue {
            capacity,
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                dropped_total: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Push an item under the queue's policy.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut state = self.state.lock();
        if self.capacity == 0 || state.items.len() < self.capacity {
            state.items.push_back(item);
            self.not_empty.notify_one();
            return PushOutcome::Accepted;
        }
        match self.policy {
            DropPolicy::DropOldest => {
                state.items.pop_front();
                state.items.push_back(item);
                state.dropped_total += 1;
                self.not_empty.notify_one();
                PushOutcome::Dropped {
                    dropped: 1,
                    accepted: true,
                }
            }
            DropPolicy::DropNewest => {
                state.dropped_total += 1;
                PushOutcome::Dropped {
                    dropped: 1,
                    accepted: false,
                }
            }
            DropPolicy::Block => {
                while state.items.len() >= self.capacity {
                    self.not_full.wait(&mut state);
                }
                state.items.push_back(item);
                self.not_empty.notify_one();
                PushOutcome::Accepted
            }
        }
    }

    /// Pop the next item, waiting up to `timeout`. `None` on timeout.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock();
        if state.items.is_empty() {
            let outcome = self.not_empty.wait_for(&mut state, timeout);
            if outcome.timed_out() && state.items.is_empty() {
                return None;
            }
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items lost to the drop policy over the queue's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.state.lock().dropped_total
    }

    /// Configured drop policy.
    pub fn policy(&self) -> DropPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drop_oldest_evicts_head() {
        let queue = BoundedQueue::new(2, DropPolicy::DropOldest);
        assert_eq!(queue.push(1), PushOutcome::Accepted);
        assert_eq!(queue.push(2), PushOutcome::Accepted);
        let outcome = queue.push(3);
        assert_eq!(outcome.dropped(), 1);
        assert_eq!(queue.pop(Duration::from_millis(1)), Some(2));
        assert_eq!(queue.pop(Duration::from_millis(1)), Some(3));
        assert_eq!(queue.dropped_total(), 1);
    }

    #[test]
    fn drop_newest_rejects_push() {
        let queue = BoundedQueue::new(1, DropPolicy::DropNewest);
        queue.push(1);
        let outcome = queue.push(2);
        assert_eq!(
            outcome,
            PushOutcome::Dropped {
                dropped: 1,
                accepted: false
            }
        );
        assert_eq!(queue.pop(Duration::from_millis(1)), Some(1));
    }

    #[test]
    fn block_policy_waits_for_consumer() {
        let queue = Arc::new(BoundedQueue::new(1, DropPolicy::Block));
        queue.push(1);
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                queue.push(2);
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(Duration::from_millis(100)), Some(1));
        producer.join().unwrap();
        assert_eq!(queue.pop(Duration::from_millis(100)), Some(2));
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1, DropPolicy::Block);
        assert_eq!(queue.pop(Duration::from_millis(5)), None);
    }
}
