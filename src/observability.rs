//! Observability hooks and staleness policies for query operations.
//!
//! This module separates two concerns:
//!
//! - **Metrics (`QueryMetrics`)**: hits, stale hits, fetch timing, dedup,
//!   discarded responses, invalidations and mutations
//! - **Staleness (`StalePolicy`)**: how long fetched data counts as fresh
//!
//! # Metrics
//!
//! Implement `QueryMetrics` to feed your monitoring system:
//!
//! ```ignore
//! use query_kit::observability::QueryMetrics;
//! use query_kit::CacheKey;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl QueryMetrics for PrometheusMetrics {
//!     fn record_fetch(&self, key: &CacheKey, duration: Duration, ok: bool) {
//!         // histogram!("query_fetch_seconds", "prefix" => key.prefix()).record(duration);
//!     }
//!     // ... other hooks keep their logging defaults
//! }
//! ```
//!
//! The default method bodies log through the `log` crate. `NoOpMetrics`
//! silences everything.
//!
//! # Staleness
//!
//! ```
//! use query_kit::observability::StalePolicy;
//! use std::time::Duration;
//!
//! // Every read revalidates in the background
//! let _policy = StalePolicy::Default;
//!
//! // Reference lists change rarely
//! let _policy = StalePolicy::PerPrefix(|prefix| match prefix {
//!     "annTypes" | "jobTypes" => Duration::from_secs(600),
//!     _ => Duration::from_secs(30),
//! });
//! ```
//!
//! | Policy | Use Case |
//! |--------|----------|
//! | `Default` | Always revalidate on read (stale immediately) |
//! | `Fixed` | Uniform freshness window |
//! | `Never` | Data stays fresh until invalidated |
//! | `PerPrefix` | Per entity kind windows |

use crate::key::{CacheKey, KeyMatcher};
use std::time::Duration;

/// Freshness window that never elapses in practice (about 30 years).
pub const NEVER_STALE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Trait for query engine metrics collection.
pub trait QueryMetrics: Send + Sync {
    /// A read was served from fresh cached data.
    fn record_hit(&self, key: &CacheKey) {
        trace!("Query HIT: {}", key);
    }

    /// A read was served from stale data while a refetch runs.
    fn record_stale_hit(&self, key: &CacheKey) {
        debug!("Query STALE HIT: {}", key);
    }

    /// A fetch settled.
    fn record_fetch(&self, key: &CacheKey, duration: Duration, ok: bool) {
        debug!(
            "Query FETCH: {} {} in {:?}",
            key,
            if ok { "ok" } else { "failed" },
            duration
        );
    }

    /// A caller attached to a fetch already in flight.
    fn record_dedup(&self, key: &CacheKey) {
        debug!("Query DEDUP: {}", key);
    }

    /// A response was dropped because a newer fetch for the key had started.
    fn record_discard(&self, key: &CacheKey) {
        debug!("Query DISCARD: {}", key);
    }

    /// A fetch failed.
    fn record_error(&self, key: &CacheKey, error: &str) {
        warn!("Query ERROR for {}: {}", key, error);
    }

    /// Entries were invalidated.
    fn record_invalidate(&self, matcher: &KeyMatcher, count: usize) {
        debug!("Query INVALIDATE: {} ({} entries)", matcher, count);
    }

    /// A mutation settled.
    fn record_mutation(&self, ok: bool, duration: Duration) {
        debug!(
            "Mutation {} in {:?}",
            if ok { "succeeded" } else { "failed" },
            duration
        );
    }
}

/// Metrics implementation that only logs (the trait defaults).
#[derive(Clone, Default)]
pub struct LogMetrics;

impl QueryMetrics for LogMetrics {}

/// Metrics implementation that does nothing.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl QueryMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &CacheKey) {}
    fn record_stale_hit(&self, _key: &CacheKey) {}
    fn record_fetch(&self, _key: &CacheKey, _duration: Duration, _ok: bool) {}
    fn record_dedup(&self, _key: &CacheKey) {}
    fn record_discard(&self, _key: &CacheKey) {}
    fn record_error(&self, _key: &CacheKey, _error: &str) {}
    fn record_invalidate(&self, _matcher: &KeyMatcher, _count: usize) {}
    fn record_mutation(&self, _ok: bool, _duration: Duration) {}
}

/// How long fetched data stays fresh.
#[derive(Clone, Debug, Default)]
pub enum StalePolicy {
    /// Stale as soon as it lands: every read revalidates in the background.
    #[default]
    Default,

    /// Fixed window for all entity kinds.
    Fixed(Duration),

    /// Fresh until invalidated.
    Never,

    /// Window chosen per key prefix.
    PerPrefix(fn(&str) -> Duration),
}

impl StalePolicy {
    /// Staleness window for an entity kind.
    pub fn stale_after(&self, prefix: &str) -> Duration {
        match self {
            StalePolicy::Default => Duration::ZERO,
            StalePolicy::Fixed(d) => *d,
            StalePolicy::Never => NEVER_STALE,
            StalePolicy::PerPrefix(f) => f(prefix),
        }
    }
}
