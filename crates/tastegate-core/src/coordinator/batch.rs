//! Optional batching of same-entity-type requests.
//!
//! When the upstream supports multi-item queries, distinct requests for
//! the same entity type arriving within a short coalescing window are
//! merged into one upstream call. Per-request result mapping is preserved
//! by canonical key; identical keys in one batch go upstream once and
//! share the answer, and a key absent from the batch response resolves
//! as `InsufficientData` without failing its neighbours.
//!
//! A request is never held past its own timeout for the sake of the
//! window: each submission caps its wait at half its own timeout, so
//! the upstream call keeps the other half. A tightened deadline flushes
//! only the batch it joined (batches are epoch-tagged), never a later
//! one.

use crate::{cache::RequestKey, types::{FetchError, Params}};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// One logical request inside a batch.
#[derive(Clone)]
pub struct BatchRequest {
    pub key: RequestKey,
    pub params: Params,
}

/// Boxed future returned by an injected multi-item fetch closure.
///
/// The success value maps canonical key strings to per-request results.
pub type BatchFuture =
    Pin<Box<dyn Future<Output = Result<HashMap<String, serde_json::Value>, FetchError>> + Send>>;

/// Injected multi-item transport closure.
pub type BatchFetchFn = Arc<dyn Fn(Vec<BatchRequest>) -> BatchFuture + Send + Sync>;

type ItemReply = oneshot::Sender<Result<serde_json::Value, FetchError>>;

struct PendingBatch {
    /// Distinguishes this batch from its successors under the same
    /// entity type, so a delayed flush timer cannot fire into a batch
    /// it never joined.
    epoch: u64,
    items: Vec<(BatchRequest, ItemReply)>,
    /// Closure captured from the first submitter of this batch window.
    fetch: BatchFetchFn,
}

/// Coalesces same-entity-type requests into multi-item upstream calls.
pub struct Batcher {
    window: Duration,
    max_batch_size: usize,
    next_epoch: AtomicU64,
    pending: Arc<Mutex<HashMap<String, PendingBatch>>>,
}

impl Batcher {
    #[must_use]
    pub fn new(window: Duration, max_batch_size: usize) -> Self {
        Self {
            window,
            max_batch_size: max_batch_size.max(1),
            next_epoch: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submits a request into the entity type's current batch window and
    /// awaits its individual result.
    ///
    /// # Errors
    ///
    /// - the upstream batch error, shared by every request in the batch
    /// - `FetchError::InsufficientData` if the batch response omits this key
    /// - `FetchError::Timeout` if the result does not arrive in time
    pub async fn submit(
        &self,
        entity_type: &str,
        request: BatchRequest,
        fetch: BatchFetchFn,
        timeout: Duration,
    ) -> Result<serde_json::Value, FetchError> {
        let (tx, rx) = oneshot::channel();
        let entity = entity_type.trim().to_lowercase();
        // Half the budget goes to coalescing at most; the upstream call
        // keeps the rest
        let max_wait = self.window.min(timeout / 2);

        let (flush_full, timer) = {
            let mut pending = self.pending.lock();
            let batch = pending.entry(entity.clone()).or_insert_with(|| PendingBatch {
                epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
                items: Vec::new(),
                fetch: Arc::clone(&fetch),
            });
            let is_first = batch.items.is_empty();
            batch.items.push((request, tx));
            trace!(entity = %entity, size = batch.items.len(), "request joined batch window");

            let full = batch.items.len() >= self.max_batch_size;
            // The first submitter arms the window timer; a later one with
            // a deadline tighter than the window arms an earlier timer for
            // the same epoch
            let timer = if !full && (is_first || max_wait < self.window) {
                Some(batch.epoch)
            } else {
                None
            };
            (full.then_some(batch.epoch), timer)
        };

        if let Some(epoch) = flush_full {
            Self::flush_map(&self.pending, &entity, Some(epoch));
        } else if let Some(epoch) = timer {
            let pending = Arc::clone(&self.pending);
            let entity = entity.clone();
            tokio::spawn(async move {
                tokio::time::sleep(max_wait).await;
                Self::flush_map(&pending, &entity, Some(epoch));
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FetchError::Other("batch dispatcher dropped the request".into())),
            Err(_) => Err(FetchError::Timeout),
        }
    }

    /// Flushes the pending batch for an entity type right now.
    pub fn flush(&self, entity_type: &str) {
        Self::flush_map(&self.pending, entity_type, None);
    }

    /// Dispatches the pending batch. With an `epoch`, only the matching
    /// batch is taken; a stale timer leaves a successor batch alone.
    fn flush_map(
        pending: &Arc<Mutex<HashMap<String, PendingBatch>>>,
        entity_type: &str,
        epoch: Option<u64>,
    ) {
        let batch = {
            let mut pending = pending.lock();
            let take = pending
                .get(entity_type)
                .map_or(false, |b| !b.items.is_empty() && epoch.map_or(true, |e| e == b.epoch));
            if !take {
                return;
            }
            match pending.remove(entity_type) {
                Some(batch) => batch,
                None => return,
            }
        };

        debug!(entity = entity_type, size = batch.items.len(), "dispatching batch");
        tokio::spawn(async move {
            // Identical keys are collapsed into a single upstream item;
            // every submitter for that key shares the one answer
            let mut seen = HashSet::new();
            let requests: Vec<BatchRequest> = batch
                .items
                .iter()
                .filter(|(req, _)| seen.insert(req.key.clone()))
                .map(|(req, _)| req.clone())
                .collect();
            let outcome = (batch.fetch)(requests).await;

            match outcome {
                Ok(results) => {
                    for (request, reply) in batch.items {
                        let result = results.get(request.key.as_str()).cloned().ok_or_else(|| {
                            FetchError::InsufficientData(format!(
                                "batch response missing key {}",
                                request.key
                            ))
                        });
                        let _ = reply.send(result);
                    }
                }
                Err(error) => {
                    // Every request in the batch shares the upstream failure
                    for (_, reply) in batch.items {
                        let _ = reply.send(Err(error.clone()));
                    }
                }
            }
        });
    }
}
