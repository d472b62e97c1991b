//! Query executor - resolves keyed datasets against the cache store.
//!
//! Read path for every view:
//!
//! | Entry state | `resolve` does |
//! |-------------|----------------|
//! | fresh data | returns it (hit) |
//! | stale, invalidated or errored, with data | returns it, refetches in the background |
//! | absent, idle, or no data | fetches (or joins the fetch in flight) and waits |
//!
//! At most one fetch per key is in flight. Fetches run on spawned Tokio tasks,
//! so a caller that goes away never cancels a fetch other callers wait on.

use crate::entry::{CacheEntry, FetchToken, QueryStatus};
use crate::error::Result;
use crate::key::CacheKey;
use crate::observability::{LogMetrics, QueryMetrics, StalePolicy};
use crate::store::CacheStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Boxed future returned by a fetch function.
pub type FetchFuture = BoxFuture<'static, Result<Value>>;

type FetchFn = Arc<dyn Fn(&CacheKey) -> FetchFuture + Send + Sync>;
type SharedFetch = Shared<FetchFuture>;

/// A keyed dataset and the function that loads it.
///
/// # Example
///
/// ```ignore
/// use query_kit::{CacheKey, QueryDescriptor};
/// use std::time::Duration;
///
/// let transport = transport.clone();
/// let regions = QueryDescriptor::new(CacheKey::new("regions"), move || {
///     let transport = transport.clone();
///     async move { transport.request(Request::get("/region/read")).await }
/// })
/// .stale_after(Duration::from_secs(30));
///
/// // Fetch functions that read their parameters from the key survive
/// // `with_key`, which is how observers move between pages.
/// let discounts = QueryDescriptor::keyed(key, move |key| {
///     let request = Request::get("/ann-discounts/read").params(key.params());
///     let transport = transport.clone();
///     async move { transport.request(request).await }
/// });
/// ```
#[derive(Clone)]
pub struct QueryDescriptor {
    key: CacheKey,
    fetch: FetchFn,
    stale_after: Option<Duration>,
}

impl QueryDescriptor {
    pub fn new<F, Fut>(key: CacheKey, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        QueryDescriptor {
            key,
            fetch: Arc::new(move |_: &CacheKey| fetch().boxed()),
            stale_after: None,
        }
    }

    /// Descriptor whose fetch function receives the key being resolved.
    pub fn keyed<F, Fut>(key: CacheKey, fetch: F) -> Self
    where
        F: Fn(&CacheKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        QueryDescriptor {
            key,
            fetch: Arc::new(move |key: &CacheKey| fetch(key).boxed()),
            stale_after: None,
        }
    }

    /// Override the client's stale policy for this dataset.
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn stale_after_override(&self) -> Option<Duration> {
        self.stale_after
    }

    /// Same fetch function, different key.
    pub fn with_key(&self, key: CacheKey) -> Self {
        QueryDescriptor {
            key,
            fetch: Arc::clone(&self.fetch),
            stale_after: self.stale_after,
        }
    }

    fn call(&self) -> FetchFuture {
        (self.fetch)(&self.key)
    }
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

struct InFlight {
    token: FetchToken,
    future: SharedFetch,
}

/// Core query executor - dedups fetches and keeps entries current.
///
/// Cloning is cheap; clones share the in-flight table and the store.
#[derive(Clone)]
pub struct QueryExecutor {
    store: CacheStore,
    in_flight: Arc<DashMap<CacheKey, InFlight>>,
    next_token: Arc<AtomicU64>,
    metrics: Arc<dyn QueryMetrics>,
    stale_policy: StalePolicy,
}

impl QueryExecutor {
    /// Create an executor over `store`.
    pub fn new(store: CacheStore) -> Self {
        QueryExecutor {
            store,
            in_flight: Arc::new(DashMap::new()),
            next_token: Arc::new(AtomicU64::new(1)),
            metrics: Arc::new(LogMetrics),
            stale_policy: StalePolicy::default(),
        }
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn QueryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the staleness policy used when a descriptor has no override.
    pub fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = policy;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Resolve a dataset, fetching only when the cached entry cannot serve it.
    ///
    /// Returns immediately with cached data when there is any, starting a
    /// background refetch if the data is stale. Without data, waits for the
    /// fetch (its own or a concurrent caller's) to settle.
    pub async fn resolve(&self, descriptor: &QueryDescriptor) -> Arc<CacheEntry> {
        let key = descriptor.key();
        let now = Instant::now();

        if let Some(entry) = self.store.get(key) {
            if !entry.needs_fetch(now) {
                self.metrics.record_hit(key);
                return entry;
            }
            if entry.has_data() {
                self.start(descriptor, false);
                self.metrics.record_stale_hit(key);
                return self.store.get(key).unwrap_or(entry);
            }
        }

        self.start(descriptor, false);
        self.wait(key).await
    }

    /// Start a new fetch even if one is in flight, and wait for it.
    ///
    /// The older fetch keeps running but its response is discarded.
    pub async fn refetch(&self, descriptor: &QueryDescriptor) -> Arc<CacheEntry> {
        self.start(descriptor, true);
        self.wait(descriptor.key()).await
    }

    /// Return fresh data, fetching when needed.
    ///
    /// Failures surface as `Err`. A caller that attached to a fetch someone
    /// else started receives `Error::Deduped` wrapping the shared failure.
    pub async fn ensure(&self, descriptor: &QueryDescriptor) -> Result<Value> {
        let key = descriptor.key();

        if let Some(entry) = self.store.get(key) {
            if let (false, Some(data)) = (entry.needs_fetch(Instant::now()), &entry.data) {
                self.metrics.record_hit(key);
                return Ok(data.clone());
            }
        }

        let (future, joined) = self.start(descriptor, false);
        let outcome = future.await;
        let settled = self.wait(key).await;

        match outcome {
            Ok(value) => Ok(settled.data.clone().unwrap_or(value)),
            // A newer fetch superseded the failed one and succeeded
            Err(_) if settled.status == QueryStatus::Success && settled.has_data() => {
                Ok(settled.data.clone().unwrap_or(Value::Null))
            }
            Err(error) if joined => Err(error.deduped()),
            Err(error) => Err(error),
        }
    }

    /// Wait until no fetch is in flight for `key`, then return its entry.
    pub async fn settled(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.wait_in_flight(key).await;
        self.store.get(key)
    }

    /// Whether a fetch for `key` is in flight.
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of keys with a fetch in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Staleness window for a descriptor.
    pub fn stale_after_for(&self, descriptor: &QueryDescriptor) -> Duration {
        descriptor
            .stale_after_override()
            .unwrap_or_else(|| self.stale_policy.stale_after(descriptor.key().prefix()))
    }

    /// Start a fetch for the descriptor's key, or join the one in flight.
    ///
    /// Returns the shared fetch future and whether it was joined rather than
    /// started. With `force`, always starts a new fetch with a newer token.
    /// A fetch whose key was invalidated after it started is never joined,
    /// since its response may predate the write that caused the invalidation.
    pub(crate) fn start(&self, descriptor: &QueryDescriptor, force: bool) -> (SharedFetch, bool) {
        let key = descriptor.key();
        let force = force
            || self
                .store
                .get(key)
                .is_some_and(|entry| entry.invalidated && entry.is_fetching());

        let (future, joined) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) if !force => {
                let token = occupied.get().token;
                let tracked = self
                    .store
                    .get(key)
                    .is_some_and(|entry| entry.in_flight == Some(token));
                if !tracked {
                    // Entry was removed mid-fetch; recreate it so the result lands
                    self.begin(key, token, self.stale_after_for(descriptor));
                }
                self.metrics.record_dedup(key);
                (occupied.get().future.clone(), true)
            }
            slot => {
                let token = FetchToken(self.next_token.fetch_add(1, Ordering::Relaxed));
                self.begin(key, token, self.stale_after_for(descriptor));

                let future = self.fetch_task(descriptor, token).shared();
                let record = InFlight {
                    token,
                    future: future.clone(),
                };
                match slot {
                    Entry::Occupied(mut occupied) => {
                        debug!("» Fetch {} supersedes {} for {}", token, occupied.get().token, key);
                        occupied.insert(record);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(record);
                    }
                }
                (future, false)
            }
        };

        if !joined {
            // Drive the fetch independently of whoever awaits it
            tokio::spawn(future.clone());
        }
        (future, joined)
    }

    /// Record the fetch start on the entry.
    fn begin(&self, key: &CacheKey, token: FetchToken, stale_after: Duration) {
        self.store.update(key, |current| {
            let mut next = current
                .cloned()
                .unwrap_or_else(|| CacheEntry::new(key.clone(), stale_after));
            next.in_flight = Some(token);
            next.invalidated = false;
            next.stale_after = stale_after;
            if next.data.is_none() {
                next.status = QueryStatus::Loading;
            }
            Some(next)
        });
        debug!("» Fetch start {} {}", key, token);
    }

    fn fetch_task(&self, descriptor: &QueryDescriptor, token: FetchToken) -> FetchFuture {
        let key = descriptor.key().clone();
        let fetch = descriptor.call();
        let store = self.store.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);

        async move {
            let started = Instant::now();
            let result = fetch.await;

            metrics.record_fetch(&key, started.elapsed(), result.is_ok());
            if let Err(e) = &result {
                metrics.record_error(&key, &e.to_string());
            }

            // Settle under the in-flight slot so no newer fetch can start between
            // writing the entry and releasing the slot.
            let applied = match in_flight.entry(key.clone()) {
                Entry::Occupied(slot) if slot.get().token == token => {
                    let applied = complete(&store, &key, token, &result);
                    slot.remove();
                    applied
                }
                _ => complete(&store, &key, token, &result),
            };

            if !applied {
                warn!("Discarding superseded response {} for {}", token, key);
                metrics.record_discard(&key);
            }
            result
        }
        .boxed()
    }

    async fn wait_in_flight(&self, key: &CacheKey) {
        loop {
            let pending = self.in_flight.get(key).map(|f| f.future.clone());
            match pending {
                Some(future) => {
                    let _ = future.await;
                }
                None => return,
            }
        }
    }

    async fn wait(&self, key: &CacheKey) -> Arc<CacheEntry> {
        self.wait_in_flight(key).await;
        self.store
            .get(key)
            .unwrap_or_else(|| Arc::new(CacheEntry::new(key.clone(), Duration::ZERO)))
    }
}

/// Write a fetch result if `token` is still the entry's authoritative fetch.
fn complete(store: &CacheStore, key: &CacheKey, token: FetchToken, result: &Result<Value>) -> bool {
    store
        .update(key, |current| {
            let current = current?;
            if current.in_flight != Some(token) {
                return None;
            }
            let mut next = current.clone();
            next.in_flight = None;
            match result {
                Ok(data) => {
                    next.status = QueryStatus::Success;
                    next.data = Some(data.clone());
                    next.error = None;
                    next.fetched_at = Some(Instant::now());
                }
                Err(error) => {
                    next.status = QueryStatus::Error;
                    next.error = Some(error.clone());
                }
            }
            Some(next)
        })
        .is_some()
}
