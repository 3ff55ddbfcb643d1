//! Request coordination: deduplication, admission, and batching.
//!
//! The coordinator sits between the orchestrator and the upstream
//! pipeline and answers one question: does this request need its own
//! upstream call, or can it share one already in flight?
//!
//! ```text
//!            ┌────────────────────────────────────────────┐
//!   request  │ RequestCoordinator                         │
//!  ────────► │   inflight map: key -> broadcast channel   │
//!            │   leader runs the producer (detached task) │
//!            │   followers await the shared outcome       │
//!            └────────────────────────────────────────────┘
//! ```
//!
//! Correctness hinges on two rules:
//!
//! 1. A follower subscribes to the leader's channel *while holding the
//!    inflight map entry* (subscribing is synchronous, so no lock is
//!    held across an await).
//! 2. The leader's task removes the inflight entry *before* broadcasting
//!    the outcome. Removal blocks on the map shard until every
//!    subscriber has released its entry ref, so no follower can observe
//!    the entry and then miss the message, and any arrival after removal
//!    starts a fresh producer instead of joining a settled one.
//!
//! The producer runs on a detached task, so a leader that is cancelled
//! (caller timeout, dropped future) does not strand its followers.

pub mod admission;
pub mod batch;

pub use admission::{AdmissionPermit, AdmissionQueue};
pub use batch::{BatchFetchFn, BatchFuture, BatchRequest, Batcher};

use crate::{cache::RequestKey, types::FetchError};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, trace, warn};

/// Outcome shared between a leader and its deduplicated followers.
///
/// Success values are `Arc`-wrapped so fan-out never clones the payload.
pub type SharedOutcome = Result<Arc<serde_json::Value>, FetchError>;

/// One upstream call in flight, shared by every identical request.
struct InflightRequest {
    tx: broadcast::Sender<SharedOutcome>,
    /// Followers attached so far, for stats.
    subscribers: AtomicUsize,
    started_at: Instant,
}

/// Result of [`RequestCoordinator::dedupe`].
pub struct DedupedOutcome {
    pub result: SharedOutcome,
    /// True when this request rode an already-in-flight producer.
    pub deduplicated: bool,
}

/// Deduplicates identical concurrent requests and tracks per-key write
/// generations for stale-write protection.
pub struct RequestCoordinator {
    inflight: Arc<DashMap<RequestKey, Arc<InflightRequest>, ahash::RandomState>>,
    generations: DashMap<RequestKey, AtomicU64, ahash::RandomState>,
    /// An inflight entry older than this is presumed wedged and is
    /// replaced by the next arrival.
    stale_after: Duration,
    deduped_total: AtomicU64,
}

impl RequestCoordinator {
    #[must_use]
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inflight: Arc::new(DashMap::with_hasher(ahash::RandomState::new())),
            generations: DashMap::with_hasher(ahash::RandomState::new()),
            stale_after,
            deduped_total: AtomicU64::new(0),
        }
    }

    /// Runs `produce` for this key, unless an identical request is
    /// already in flight, in which case its outcome is shared instead.
    ///
    /// The producer runs on a detached task: cancelling this future never
    /// cancels the upstream call other waiters depend on.
    pub async fn dedupe<F>(&self, key: &RequestKey, produce: F) -> DedupedOutcome
    where
        F: Future<Output = Result<serde_json::Value, FetchError>> + Send + 'static,
    {
        let mut rx = loop {
            match self.inflight.entry(key.clone()) {
                Entry::Occupied(entry) => {
                    let existing = entry.get();
                    if existing.started_at.elapsed() > self.stale_after {
                        // Wedged leader: evict and take over on the next
                        // loop iteration. Its task, if ever it settles,
                        // only removes its own entry (pointer-checked).
                        warn!(
                            key = %key,
                            age_ms = existing.started_at.elapsed().as_millis() as u64,
                            "replacing stale in-flight request"
                        );
                        entry.remove();
                        continue;
                    }
                    // Subscribe under the entry ref (rule 1)
                    let rx = existing.tx.subscribe();
                    existing.subscribers.fetch_add(1, Ordering::Relaxed);
                    drop(entry);

                    self.deduped_total.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %key, "joined in-flight request");
                    let result = Self::recv_outcome(rx).await;
                    return DedupedOutcome { result, deduplicated: true };
                }
                Entry::Vacant(entry) => {
                    // One message ever flows through the channel
                    let (tx, rx) = broadcast::channel(1);
                    let inflight = Arc::new(InflightRequest {
                        tx,
                        subscribers: AtomicUsize::new(0),
                        started_at: Instant::now(),
                    });
                    entry.insert(Arc::clone(&inflight));

                    let map = Arc::clone(&self.inflight);
                    let key = key.clone();
                    tokio::spawn(async move {
                        let outcome = produce.await.map(Arc::new);
                        // Remove before send (rule 2)
                        map.remove_if(&key, |_, v| Arc::ptr_eq(v, &inflight));
                        if inflight.tx.send(outcome).is_err() {
                            // Every waiter gave up before the call settled
                            debug!(key = %key, "in-flight outcome had no receivers");
                        }
                    });
                    break rx;
                }
            }
        };

        let result = Self::recv_outcome_inner(&mut rx).await;
        DedupedOutcome { result, deduplicated: false }
    }

    async fn recv_outcome(mut rx: broadcast::Receiver<SharedOutcome>) -> SharedOutcome {
        Self::recv_outcome_inner(&mut rx).await
    }

    async fn recv_outcome_inner(rx: &mut broadcast::Receiver<SharedOutcome>) -> SharedOutcome {
        match rx.recv().await {
            Ok(outcome) => outcome,
            // Sender dropped without sending: the producer task panicked
            Err(_) => Err(FetchError::Other("in-flight producer dropped".into())),
        }
    }

    /// Starts a new write generation for a key and returns it.
    ///
    /// Called before an upstream fetch begins, and again on invalidation:
    /// a cache write is allowed only while its generation is still
    /// current, so a slow fetch never overwrites fresher data.
    pub fn begin_generation(&self, key: &RequestKey) -> u64 {
        self.generations
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Whether `generation` is still the latest for this key.
    #[must_use]
    pub fn is_current(&self, key: &RequestKey, generation: u64) -> bool {
        self.generations
            .get(key)
            .is_some_and(|gen| gen.load(Ordering::SeqCst) == generation)
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Total requests that shared an in-flight producer.
    #[must_use]
    pub fn deduped_total(&self) -> u64 {
        self.deduped_total.load(Ordering::Relaxed)
    }

    /// Drops in-flight entries older than the staleness threshold.
    ///
    /// Waiters on a dropped entry still settle normally (they hold their
    /// own receiver); the entry removal only stops new arrivals from
    /// joining a wedged call. Returns the number of entries dropped.
    pub fn sweep(&self) -> usize {
        let before = self.inflight.len();
        self.inflight.retain(|_, v| v.started_at.elapsed() <= self.stale_after);
        before - self.inflight.len()
    }
}
