// src/cache/coalesce.rs
//! Request coalescing (singleflight pattern)
//!
//! When several tasks ask for the same key while a fetch for it is still
//! in flight, only the first one performs the fetch. The others wait for
//! its result and share it, so one network request produces one cache
//! write.

use crate::cancel::cancellable;
use crate::error::{Error, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result shared with waiting tasks
#[derive(Clone)]
enum SharedResult<T> {
    Success(T),
    /// Waiters get an error of the same variant
    Failure(Arc<Error>),
    /// The leading task was cancelled; waiters fetch on their own
    Abandoned,
}

type Slot<T> = broadcast::Sender<SharedResult<T>>;

/// What a caller does for a key
enum Role<T> {
    Leader(Slot<T>),
    Follower(broadcast::Receiver<SharedResult<T>>),
}

/// Request coalescer keyed by string
pub struct RequestCoalescer<T: Clone> {
    /// In-flight requests (key -> broadcast sender)
    inflight: DashMap<String, Slot<T>>,
    /// Count of coalesced (deduplicated) requests
    coalesced_count: AtomicU64,
}

impl<T: Clone> RequestCoalescer<T> {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
            coalesced_count: AtomicU64::new(0),
        }
    }

    /// Coalesce concurrent requests for the same key
    ///
    /// If another task is already fetching `key`, wait for that result.
    /// Otherwise run `fetch` and broadcast its result to any waiters. A
    /// cancelled leader is not reported to waiters as a failure; they
    /// retry with their own fetch instead. A waiter stops waiting as soon
    /// as its own `cancel` fires.
    pub async fn coalesce<F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            match self.claim(key) {
                Role::Follower(mut rx) => {
                    debug!("Coalescing request for {}", key);
                    self.coalesced_count.fetch_add(1, Ordering::Relaxed);

                    let received = cancellable(cancel, async { Ok(rx.recv().await) }).await?;
                    match received {
                        Ok(SharedResult::Success(value)) => return Ok(value),
                        Ok(SharedResult::Failure(error)) => return Err(error.replicate()),
                        Ok(SharedResult::Abandoned) | Err(_) => {
                            debug!("Coalesced request for {} abandoned, fetching directly", key)
                        }
                    }
                }
                Role::Leader(tx) => {
                    let guard = InflightGuard {
                        inflight: &self.inflight,
                        key,
                    };
                    let result = fetch().await;

                    let shared = match &result {
                        Ok(value) => SharedResult::Success(value.clone()),
                        Err(Error::Cancelled) => SharedResult::Abandoned,
                        Err(e) => SharedResult::Failure(Arc::new(e.replicate())),
                    };
                    // No receivers is fine
                    let _ = tx.send(shared);
                    drop(guard);
                    return result;
                }
            }
        }
    }

    /// Atomically join the in-flight request for `key` or become its leader
    fn claim(&self, key: &str) -> Role<T> {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => Role::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                Role::Leader(tx)
            }
        }
    }

    /// Number of requests that were served by another task's fetch
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced_count.load(Ordering::Relaxed)
    }

    /// Number of fetches currently in flight
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

/// Removes the in-flight entry even when the leading future is dropped,
/// so waiters see a closed channel instead of hanging
struct InflightGuard<'a, T> {
    inflight: &'a DashMap<String, Slot<T>>,
    key: &'a str,
}

impl<T> Drop for InflightGuard<'_, T> {
    fn drop(&mut self) {
        self.inflight.remove(self.key);
    }
}

impl<T: Clone> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}
