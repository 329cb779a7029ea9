//! Per-key deduplication of concurrent fetches.
//!
//! The first caller for a key spawns the fetch as its own task and registers a shared
//! handle to it; callers arriving while it runs await the same handle. The task
//! forgets its key when it finishes, so the next call after completion starts a fresh
//! fetch. Since the fetch is a task of its own, a caller that gives up (cancellation,
//! deadline) never takes the fetch down with it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};

use crate::context::RequestContext;
use crate::error::{StateError, StateResult};

type SharedCall<T> = Shared<BoxFuture<'static, StateResult<T>>>;

struct Call<T: Clone> {
    generation: u64,
    result: SharedCall<T>,
}

/// Removes a finished call from the group, also when the fetch panics.
struct Forget<T: Clone> {
    calls: Arc<DashMap<String, Call<T>>>,
    key: String,
    generation: u64,
}

impl<T: Clone> Drop for Forget<T> {
    fn drop(&mut self) {
        self.calls
            .remove_if(&self.key, |_, call| call.generation == self.generation);
    }
}

/// A group of keyed in-flight calls producing values of type `T`.
pub struct SingleFlight<T: Clone> {
    calls: Arc<DashMap<String, Call<T>>>,
    next_generation: AtomicU64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key` unless a call for `key` is already in flight, in which case
    /// wait for that call's outcome instead. Every caller of one flight observes the
    /// same value or error.
    ///
    /// `f` is only invoked by the caller that starts the flight.
    pub async fn run<F, Fut>(&self, ctx: &RequestContext, key: &str, f: F) -> StateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StateResult<T>> + Send + 'static,
    {
        let call = match self.calls.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                tracing::debug!(key = %key, "joining in-flight fetch");
                crate::metrics::record_singleflight_join();
                entry.get().result.clone()
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let forget = Forget {
                    calls: Arc::clone(&self.calls),
                    key: key.to_string(),
                    generation,
                };
                let fut = f();

                // The vacant entry holds the shard lock until the call is registered,
                // so the task cannot forget the key before it is inserted.
                let task = tokio::spawn(async move {
                    let _forget = forget;
                    fut.await
                });

                let result: SharedCall<T> = async move {
                    task.await
                        .unwrap_or_else(|e| Err(StateError::Aborted(e.to_string())))
                }
                .boxed()
                .shared();

                entry.insert(Call {
                    generation,
                    result: result.clone(),
                });
                result
            }
        };

        ctx.run(call).await
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}
