//! High-level query client for the rendering layer.
//!
//! Owns one cache store and the executors around it, wrapped in `Arc` for
//! easy sharing between views and tasks.

use crate::error::Result;
use crate::invalidation::{InvalidationBus, InvalidationEvent};
use crate::key::{CacheKey, KeyMatcher, ParamValue, QueryParams};
use crate::mutation::{MutationDescriptor, MutationExecutor, MutationHandle};
use crate::observability::{LogMetrics, QueryMetrics, StalePolicy};
use crate::observer::{ObserverOptions, QueryObserver};
use crate::pagination::PaginationFilter;
use crate::query::{QueryDescriptor, QueryExecutor};
use crate::store::{CacheStore, StoreConfig, StoreStats, Undo};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Client settings.
///
/// ```
/// use query_kit::client::ClientConfig;
/// use query_kit::observability::StalePolicy;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_stale_policy(StalePolicy::Fixed(Duration::from_secs(30)))
///     .with_gc_horizon(Duration::from_secs(120))
///     .with_keep_previous_data(false);
/// assert_eq!(config.gc_interval, Duration::from_secs(60));
/// ```
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub stale_policy: StalePolicy,
    /// Unobserved entries older than this are evicted.
    pub gc_horizon: Duration,
    /// Period of the background sweeper started by [`QueryClient::spawn_gc`].
    pub gc_interval: Duration,
    pub keep_previous_data: bool,
    pub refetch_on_invalidate: bool,
    /// Buffered invalidation events per subscriber.
    pub invalidation_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            stale_policy: StalePolicy::Default,
            gc_horizon: Duration::from_secs(300),
            gc_interval: Duration::from_secs(60),
            keep_previous_data: true,
            refetch_on_invalidate: true,
            invalidation_capacity: crate::invalidation::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = policy;
        self
    }

    pub fn with_gc_horizon(mut self, horizon: Duration) -> Self {
        self.gc_horizon = horizon;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    pub fn with_refetch_on_invalidate(mut self, refetch: bool) -> Self {
        self.refetch_on_invalidate = refetch;
        self
    }

    pub fn with_invalidation_capacity(mut self, capacity: usize) -> Self {
        self.invalidation_capacity = capacity;
        self
    }

    fn observer_options(&self) -> ObserverOptions {
        ObserverOptions {
            keep_previous_data: self.keep_previous_data,
            refetch_on_invalidate: self.refetch_on_invalidate,
        }
    }
}

struct ClientInner {
    store: CacheStore,
    queries: QueryExecutor,
    mutations: MutationExecutor,
    bus: InvalidationBus,
    config: ClientConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point for views: queries, mutations and cache access.
///
/// Cloning is cheap; every clone shares the same cache.
///
/// # Example
///
/// ```ignore
/// use query_kit::{QueryClient, Resource, CreatePolicy, QueryParams};
/// use query_kit::transport::InMemoryTransport;
///
/// let client = QueryClient::new();
/// let transport = InMemoryTransport::new();
/// let regions = Resource::new("regions", "/regions");
///
/// // useQuery
/// let mut list = client.observe(regions.list_query(&transport, QueryParams::new()));
/// let first = list.settled().await;
///
/// // useMutation
/// let create = client.use_mutation(regions.create(&transport, CreatePolicy::Invalidate));
/// create.mutate(serde_json::json!({"name": "North"})).await?;
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Create a client with default settings.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self::build(config, Arc::new(LogMetrics))
    }

    /// Create a client with custom metrics.
    pub fn with_metrics(config: ClientConfig, metrics: Box<dyn QueryMetrics>) -> Self {
        Self::build(config, Arc::from(metrics))
    }

    fn build(config: ClientConfig, metrics: Arc<dyn QueryMetrics>) -> Self {
        let store = CacheStore::with_config(StoreConfig {
            default_stale_after: Duration::ZERO,
            gc_horizon: config.gc_horizon,
        });
        let bus = InvalidationBus::with_capacity(store.clone(), config.invalidation_capacity)
            .with_metrics(Arc::clone(&metrics));
        let queries = QueryExecutor::new(store.clone())
            .with_metrics(Arc::clone(&metrics))
            .with_stale_policy(config.stale_policy.clone());
        let mutations = MutationExecutor::new(store.clone(), bus.clone()).with_metrics(metrics);

        QueryClient {
            inner: Arc::new(ClientInner {
                store,
                queries,
                mutations,
                bus,
                config,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn queries(&self) -> &QueryExecutor {
        &self.inner.queries
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.inner.bus
    }

    /// Observe `(prefix, params)`, loading it with `fetch`.
    ///
    /// `fetch` receives the key being resolved, so the observer can move
    /// between parameter sets with [`QueryObserver::set_params`]. `stale_after`
    /// overrides the client's stale policy for this dataset.
    pub fn use_query<F, Fut>(
        &self,
        prefix: impl Into<String>,
        params: QueryParams,
        fetch: F,
        stale_after: Option<Duration>,
    ) -> QueryObserver
    where
        F: Fn(&CacheKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let descriptor = QueryDescriptor::keyed(CacheKey::with_params(prefix, params), fetch);
        let descriptor = match stale_after {
            Some(stale_after) => descriptor.stale_after(stale_after),
            None => descriptor,
        };
        self.observe(descriptor)
    }

    /// Observe a prepared descriptor.
    pub fn observe(&self, descriptor: QueryDescriptor) -> QueryObserver {
        QueryObserver::new(
            self.inner.queries.clone(),
            descriptor,
            self.inner.config.observer_options(),
        )
    }

    /// Fresh data for the descriptor, fetching when needed (`fetchQuery`).
    pub async fn fetch_query(&self, descriptor: &QueryDescriptor) -> Result<Value> {
        self.inner.queries.ensure(descriptor).await
    }

    /// Warm the cache without observing.
    pub async fn prefetch(&self, descriptor: &QueryDescriptor) {
        self.inner.queries.resolve(descriptor).await;
    }

    pub fn use_mutation<I>(&self, descriptor: MutationDescriptor<I>) -> MutationHandle<I>
    where
        I: Clone + Send + 'static,
    {
        MutationHandle::new(self.inner.mutations.clone(), descriptor)
    }

    /// Run a mutation once without a handle.
    pub async fn mutate<I>(&self, descriptor: &MutationDescriptor<I>, input: I) -> Result<Value>
    where
        I: Clone + Send + 'static,
    {
        self.inner.mutations.run(descriptor, input).await
    }

    pub fn use_pagination_filter<K, V>(
        &self,
        page: u32,
        size: u32,
        filters: impl IntoIterator<Item = (K, V)>,
    ) -> Result<PaginationFilter>
    where
        K: Into<String>,
        V: Into<ParamValue>,
    {
        PaginationFilter::new(page, size, filters)
    }

    pub fn invalidate(&self, matcher: impl Into<KeyMatcher>) -> usize {
        self.inner.bus.invalidate(matcher)
    }

    pub fn invalidate_all(&self) -> usize {
        self.inner.bus.invalidate_all()
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.inner.bus.subscribe()
    }

    /// Write data for `key` as if it had just been fetched (`setQueryData`).
    pub fn set_query_data(&self, key: &CacheKey, data: Value) {
        self.inner.store.set_data(key, data);
    }

    /// Transform cached data for `key` in place. `None` when there is none.
    pub fn update_query_data<F>(&self, key: &CacheKey, transform: F) -> Option<Undo>
    where
        F: FnOnce(&Value) -> Value,
    {
        self.inner.store.patch(key, transform)
    }

    pub fn get_query_data(&self, key: &CacheKey) -> Option<Value> {
        self.inner.store.get_data(key)
    }

    /// Drop every cached view of a prefix.
    pub fn remove_queries(&self, matcher: impl Into<KeyMatcher>) -> usize {
        let matcher = matcher.into();
        let keys = self.inner.store.keys_matching(&matcher);
        keys.iter()
            .filter(|key| self.inner.store.remove(key).is_some())
            .count()
    }

    /// Start the background sweeper. Calling it again restarts it.
    pub fn spawn_gc(&self) {
        let handle = self.inner.store.spawn_gc(self.inner.config.gc_interval);
        let previous = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Evict unobserved entries past the GC horizon now.
    pub fn gc(&self) -> usize {
        self.inner.store.gc()
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.store.stats()
    }

    /// Stop the sweeper and drop every cached entry.
    pub fn shutdown(&self) {
        info!("Query client shutting down");
        self.inner.store.shutdown();
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}
