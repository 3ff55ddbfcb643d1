//! Priority-aware concurrency admission.
//!
//! Bounds the number of simultaneously executing upstream producers.
//! When permits run out, waiters queue and are released
//! highest-priority-first; ties break by arrival sequence (FIFO) so
//! equal-priority background work is never starved.
//!
//! Permits are RAII: dropping an [`AdmissionPermit`] releases the slot.
//! A waiter that gives up (timeout, cancellation) is skipped at grant
//! time via its closed reply channel.

use parking_lot::Mutex;
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::Arc,
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::trace;

struct Waiter {
    score: u8,
    seq: u64,
    reply: oneshot::Sender<AdmissionPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.seq == other.seq
    }
}
impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher score first, then lower sequence (earlier arrival)
        self.score.cmp(&other.score).then(other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    available: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

struct Inner {
    state: Mutex<QueueState>,
}

impl Inner {
    /// Hands the freed slot to the best live waiter, or banks it.
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop() {
            if waiter.reply.is_closed() {
                // Waiter timed out or was cancelled; skip it
                continue;
            }
            let permit = AdmissionPermit { inner: Some(Arc::clone(self)) };
            match waiter.reply.send(permit) {
                Ok(()) => return,
                Err(mut lost) => {
                    // Receiver vanished between the is_closed check and the
                    // send. Disarm the returned permit so dropping it neither
                    // re-enters release() under the lock nor leaks the queue
                    // handle; the slot stays with the loop for the next waiter.
                    lost.inner.take();
                }
            }
        }
        state.available += 1;
    }
}

/// RAII permit for one concurrent upstream producer.
pub struct AdmissionPermit {
    inner: Option<Arc<Inner>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

/// Bounded admission queue with priority ordering.
pub struct AdmissionQueue {
    inner: Arc<Inner>,
}

impl AdmissionQueue {
    /// Creates a queue with `limit` concurrent permits (minimum 1).
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    available: limit.max(1),
                    next_seq: 0,
                    waiters: BinaryHeap::new(),
                }),
            }),
        }
    }

    /// Acquires a permit, waiting up to `timeout` behind higher-priority
    /// requests. Returns `None` on timeout.
    pub async fn acquire(&self, score: u8, timeout: Duration) -> Option<AdmissionPermit> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.available > 0 {
                state.available -= 1;
                return Some(AdmissionPermit { inner: Some(Arc::clone(&self.inner)) });
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { score, seq, reply: tx });
            trace!(score, seq, "queued for admission");
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(permit)) => Some(permit),
            // Sender dropped (queue torn down) or timed out
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Permits currently available (not queued behind).
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[tokio::test]
    async fn test_acquire_within_limit_is_immediate() {
        let queue = AdmissionQueue::new(2);
        let a = queue.acquire(1, Duration::from_secs(1)).await;
        let b = queue.acquire(1, Duration::from_secs(1)).await;
        assert!(a.is_some() && b.is_some());
        assert_eq!(queue.available(), 0);

        drop(a);
        assert_eq!(queue.available(), 1);
    }

    #[tokio::test]
    async fn test_waiters_released_by_priority_then_fifo() {
        let queue = Arc::new(AdmissionQueue::new(1));
        let held = queue.acquire(1, Duration::from_secs(1)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        // Queue: background, normal, interactive, then a second normal
        for (label, priority) in [
            ("bg", Priority::Background),
            ("normal-1", Priority::Normal),
            ("interactive", Priority::Interactive),
            ("normal-2", Priority::Normal),
        ] {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = queue.acquire(priority.score(), Duration::from_secs(5)).await;
                order.lock().push(label);
                drop(permit);
            }));
            // Deterministic arrival order
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec!["interactive", "normal-1", "normal-2", "bg"]);
    }

    #[tokio::test]
    async fn test_disarmed_permit_neither_releases_nor_retains_the_queue() {
        // The lost-race branch in release() disarms the permit before
        // dropping it; that drop must not free the slot twice and must
        // give the queue handle back
        let queue = AdmissionQueue::new(1);
        let baseline = Arc::strong_count(&queue.inner);

        let mut permit = AdmissionPermit { inner: Some(Arc::clone(&queue.inner)) };
        permit.inner.take();
        drop(permit);

        assert_eq!(Arc::strong_count(&queue.inner), baseline);
        assert_eq!(queue.available(), 1, "a disarmed permit must not bank an extra slot");
    }

    #[tokio::test]
    async fn test_acquire_times_out_and_slot_skips_dead_waiter() {
        let queue = Arc::new(AdmissionQueue::new(1));
        let held = queue.acquire(1, Duration::from_secs(1)).await.unwrap();

        // This waiter gives up quickly
        assert!(queue.acquire(1, Duration::from_millis(20)).await.is_none());

        // A later waiter must still get the slot once it frees up
        let queue2 = Arc::clone(&queue);
        let waiter = tokio::spawn(async move {
            queue2.acquire(1, Duration::from_secs(5)).await.is_some()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(held);
        assert!(waiter.await.unwrap());
    }
}
