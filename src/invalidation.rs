//! Invalidation bus.
//!
//! Marks cached datasets non-authoritative after writes and publishes what was
//! invalidated to anyone listening. Invalidation is prefix based: one write to
//! an entity kind invalidates every page and filter combination cached for it.

use crate::key::KeyMatcher;
use crate::observability::{LogMetrics, QueryMetrics};
use crate::store::CacheStore;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the event channel when none is configured.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Published on every invalidation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationEvent {
    /// Entries selected by a matcher were invalidated.
    Prefix { matcher: KeyMatcher, count: usize },
    /// Every entry was invalidated.
    All { count: usize },
}

impl InvalidationEvent {
    /// Number of entries the invalidation marked.
    pub fn count(&self) -> usize {
        match self {
            InvalidationEvent::Prefix { count, .. } | InvalidationEvent::All { count } => *count,
        }
    }

    /// Whether this event touches entries selected by `matcher`'s prefix.
    pub fn covers(&self, prefix: &str) -> bool {
        match self {
            InvalidationEvent::Prefix { matcher, .. } => matcher.prefix_str() == prefix,
            InvalidationEvent::All { .. } => true,
        }
    }
}

#[derive(Clone)]
pub struct InvalidationBus {
    store: CacheStore,
    events: broadcast::Sender<InvalidationEvent>,
    metrics: Arc<dyn QueryMetrics>,
}

impl InvalidationBus {
    pub fn new(store: CacheStore) -> Self {
        Self::with_capacity(store, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(store: CacheStore, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        InvalidationBus {
            store,
            events,
            metrics: Arc::new(LogMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn QueryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Mark every entry selected by `matcher` stale, keeping its data.
    ///
    /// The next read of a marked key goes to the network. A fetch already in
    /// flight still lands, but the entry stays marked.
    pub fn invalidate(&self, matcher: impl Into<KeyMatcher>) -> usize {
        let matcher = matcher.into();
        let count = self.store.invalidate(&matcher);
        self.metrics.record_invalidate(&matcher, count);
        self.publish(InvalidationEvent::Prefix { matcher, count });
        count
    }

    /// Invalidate several matchers, returning the total number of entries marked.
    pub fn invalidate_many<I, M>(&self, matchers: I) -> usize
    where
        I: IntoIterator<Item = M>,
        M: Into<KeyMatcher>,
    {
        matchers.into_iter().map(|m| self.invalidate(m)).sum()
    }

    pub fn invalidate_all(&self) -> usize {
        let count = self.store.invalidate_all();
        debug!("Query INVALIDATE * ({} entries)", count);
        self.publish(InvalidationEvent::All { count });
        count
    }

    /// Receive every invalidation published after this call.
    ///
    /// Slow receivers see `RecvError::Lagged` once the channel is full.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: InvalidationEvent) {
        // No receivers is not an error
        let _ = self.events.send(event);
    }
}
