//! Request coalescing for store lookups.
//!
//! A burst of typing indicators or messages in one conversation triggers the
//! same participants lookup many times within a few milliseconds. The
//! [`CoalescingService`] lets concurrent callers asking for the same key share
//! one in-flight store call instead of issuing one each.

use crate::error::StoreError;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

type SharedLookup<T> = Shared<BoxFuture<'static, Result<Arc<T>, StoreError>>>;

/// Snapshot of the service counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoalescingStats {
    /// Lookups that actually reached the store.
    pub initiated_operations: usize,
    /// Callers that joined a lookup already in flight.
    pub coalesced_requests: usize,
    /// Initiated lookups that failed (timeouts excluded).
    pub failed_operations: usize,
    /// Initiated lookups that hit the timeout.
    pub timed_out_operations: usize,
}

#[derive(Debug, Default)]
struct Counters {
    initiated: AtomicUsize,
    coalesced: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
}

/// Shares in-flight lookups between concurrent callers with the same key.
pub struct CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    inflight: Arc<Mutex<HashMap<K, SharedLookup<T>>>>,
    timeout: Option<Duration>,
    counters: Arc<Counters>,
}

impl<K, T> CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            timeout: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Lookups running longer than `timeout` fail with
    /// [`StoreError::Transient`] for every caller sharing them.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new()
        }
    }

    /// Runs `operation` for `key`, or joins the run already in flight.
    ///
    /// `operation` is only invoked when no lookup for `key` is pending. The
    /// key is released as soon as the lookup settles, so results are never
    /// cached past the moment they were produced.
    #[instrument(level = "debug", skip(self, operation), fields(key = ?key))]
    pub async fn execute<F, Fut>(&self, key: K, operation: F) -> Result<Arc<T>, StoreError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let lookup = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&key) {
                debug!("Joining lookup already in flight.");
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                existing.clone()
            } else {
                self.counters.initiated.fetch_add(1, Ordering::Relaxed);
                let lookup = self.start(key.clone(), operation);
                inflight.insert(key, lookup.clone());
                lookup
            }
        };

        lookup.await
    }

    fn start<F, Fut>(&self, key: K, operation: F) -> SharedLookup<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let inflight = Arc::clone(&self.inflight);
        let counters = Arc::clone(&self.counters);
        let limit = self.timeout;

        async move {
            let outcome = match limit {
                Some(limit) => tokio::time::timeout(limit, operation())
                    .await
                    .map_err(|_| limit),
                None => Ok(operation().await),
            };

            inflight.lock().await.remove(&key);

            match outcome {
                Ok(Ok(value)) => Ok(Arc::new(value)),
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
                Err(limit) => {
                    warn!(?key, "Lookup timed out after {:?}", limit);
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    Err(StoreError::Transient(format!(
                        "lookup for {:?} timed out after {:?}",
                        key, limit
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }

    pub fn stats(&self) -> CoalescingStats {
        CoalescingStats {
            initiated_operations: self.counters.initiated.load(Ordering::Relaxed),
            coalesced_requests: self.counters.coalesced.load(Ordering::Relaxed),
            failed_operations: self.counters.failed.load(Ordering::Relaxed),
            timed_out_operations: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Number of distinct keys with a lookup in flight.
    pub async fn pending(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

impl<K, T> fmt::Debug for CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingService")
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<K, T> Clone for CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            timeout: self.timeout,
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<K, T> Default for CoalescingService<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
