//! Query observers - the subscription side of `use_query`.
//!
//! An observer subscribes to one cache key, mirrors its entry into a
//! `tokio::sync::watch` channel the rendering layer can await, and keeps the
//! entry current:
//!
//! - on creation and on every key change it resolves the query in the background
//! - when its entry is invalidated it schedules one resolve (its "next read")
//! - while a new key has no data yet it can keep reporting the previous key's
//!   data, flagged as placeholder
//!
//! Dropping the observer removes its subscription. The entry itself stays in
//! the store until garbage collection.

use crate::entry::{CacheEntry, QueryStatus};
use crate::error::Error;
use crate::key::{CacheKey, QueryParams};
use crate::query::{QueryDescriptor, QueryExecutor};
use crate::store::{Listener, SubscriptionId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Per-observer behaviour switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverOptions {
    /// Report the previous key's data while a new key loads.
    pub keep_previous_data: bool,
    /// Resolve again as soon as the entry is invalidated.
    pub refetch_on_invalidate: bool,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        ObserverOptions {
            keep_previous_data: true,
            refetch_on_invalidate: true,
        }
    }
}

/// What a view renders.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub key: CacheKey,
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub error: Option<Error>,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub is_invalidated: bool,
    /// `data` belongs to the previously observed key.
    pub is_placeholder: bool,
    /// Revision of the entry this result was built from.
    pub revision: u64,
}

impl QueryResult {
    fn from_entry(entry: &CacheEntry, placeholder: Option<&Value>) -> Self {
        let (data, is_placeholder) = match (&entry.data, placeholder) {
            (Some(data), _) => (Some(data.clone()), false),
            (None, Some(previous)) => (Some(previous.clone()), true),
            (None, None) => (None, false),
        };

        QueryResult {
            key: entry.key.clone(),
            data,
            status: entry.status,
            error: entry.error.clone(),
            is_fetching: entry.is_fetching(),
            is_stale: entry.is_stale(Instant::now()),
            is_invalidated: entry.invalidated,
            is_placeholder,
            revision: entry.revision,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

pub struct QueryObserver {
    executor: QueryExecutor,
    descriptor: QueryDescriptor,
    options: ObserverOptions,
    state: Arc<watch::Sender<QueryResult>>,
    receiver: watch::Receiver<QueryResult>,
    subscription: SubscriptionId,
}

impl QueryObserver {
    /// Subscribe to the descriptor's key and start resolving it.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(executor: QueryExecutor, descriptor: QueryDescriptor, options: ObserverOptions) -> Self {
        let key = descriptor.key().clone();
        let initial = executor
            .store()
            .get(&key)
            .unwrap_or_else(|| Arc::new(CacheEntry::new(key, executor.stale_after_for(&descriptor))));
        let (state, mut receiver) = watch::channel(QueryResult::from_entry(&initial, None));
        let state = Arc::new(state);

        let subscription = attach(&executor, &descriptor, &state, options, None);
        // `changed` reports transitions after this point
        receiver.borrow_and_update();

        QueryObserver {
            executor,
            descriptor,
            options,
            state,
            receiver,
            subscription,
        }
    }

    pub fn key(&self) -> &CacheKey {
        self.descriptor.key()
    }

    /// Snapshot of the latest result.
    pub fn result(&self) -> QueryResult {
        self.state.borrow().clone()
    }

    pub fn data(&self) -> Option<Value> {
        self.state.borrow().data.clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.state.borrow().status
    }

    pub fn error(&self) -> Option<Error> {
        self.state.borrow().error.clone()
    }

    pub fn is_fetching(&self) -> bool {
        self.state.borrow().is_fetching
    }

    pub fn is_placeholder(&self) -> bool {
        self.state.borrow().is_placeholder
    }

    /// Fetch again even if the data is fresh.
    pub async fn refetch(&self) -> QueryResult {
        self.executor.refetch(&self.descriptor).await;
        self.result()
    }

    /// Wait for the next change and return it.
    pub async fn changed(&mut self) -> QueryResult {
        // The sender lives as long as `self`, so this cannot fail
        let _ = self.receiver.changed().await;
        self.receiver.borrow_and_update().clone()
    }

    /// Wait until the observed key has settled: fetched at least once, nothing
    /// in flight and no refetch pending from an invalidation.
    pub async fn settled(&self) -> QueryResult {
        let mut receiver = self.state.subscribe();
        loop {
            let current = receiver.borrow_and_update().clone();
            if self.is_settled(&current) {
                return current;
            }
            if receiver.changed().await.is_err() {
                return current;
            }
        }
    }

    fn is_settled(&self, result: &QueryResult) -> bool {
        let pending = matches!(result.status, QueryStatus::Idle | QueryStatus::Loading);
        let refetch_due = self.options.refetch_on_invalidate && result.is_invalidated;
        !pending && !result.is_fetching && !refetch_due
    }

    /// Independent receiver for the rendering layer.
    pub fn watch(&self) -> watch::Receiver<QueryResult> {
        self.state.subscribe()
    }

    /// Move to a new parameter set under the same prefix.
    ///
    /// With `keep_previous_data` the current data stays visible, flagged as
    /// placeholder, until the new key has data of its own.
    pub fn set_params(&mut self, params: QueryParams) {
        let key = CacheKey::with_params(self.descriptor.key().prefix(), params);
        if &key == self.descriptor.key() {
            return;
        }

        let placeholder = if self.options.keep_previous_data {
            self.data()
        } else {
            None
        };

        self.executor
            .store()
            .unsubscribe(self.descriptor.key(), self.subscription);
        debug!("» Observer moves {} -> {}", self.descriptor.key(), key);

        self.descriptor = self.descriptor.with_key(key);
        self.subscription = attach(
            &self.executor,
            &self.descriptor,
            &self.state,
            self.options,
            placeholder,
        );
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.executor
            .store()
            .unsubscribe(self.descriptor.key(), self.subscription);
    }
}

/// Subscribe a listener that mirrors the entry into `state`, publish the
/// current snapshot and kick off a background resolve.
fn attach(
    executor: &QueryExecutor,
    descriptor: &QueryDescriptor,
    state: &Arc<watch::Sender<QueryResult>>,
    options: ObserverOptions,
    placeholder: Option<Value>,
) -> SubscriptionId {
    let listener: Listener = {
        let state = Arc::clone(state);
        let executor = executor.clone();
        let descriptor = descriptor.clone();
        let placeholder = placeholder.clone();

        Arc::new(move |entry: &Arc<CacheEntry>| {
            publish(&state, entry, placeholder.as_ref());

            if options.refetch_on_invalidate && entry.invalidated && !entry.is_fetching() {
                debug!("» Observer refetch on invalidate {}", entry.key);
                spawn_resolve(&executor, &descriptor);
            }
        })
    };

    let key = descriptor.key();
    let subscription = executor.store().subscribe(key, listener);
    if let Some(entry) = executor.store().get(key) {
        publish(state, &entry, placeholder.as_ref());
    }
    spawn_resolve(executor, descriptor);
    subscription
}

fn publish(state: &watch::Sender<QueryResult>, entry: &CacheEntry, placeholder: Option<&Value>) {
    let next = QueryResult::from_entry(entry, placeholder);
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

fn spawn_resolve(executor: &QueryExecutor, descriptor: &QueryDescriptor) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No Tokio runtime, not resolving {}", descriptor.key());
        return;
    };
    let executor = executor.clone();
    let descriptor = descriptor.clone();
    runtime.spawn(async move {
        executor.resolve(&descriptor).await;
    });
}
