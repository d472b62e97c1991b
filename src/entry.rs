//! Cache entries and their lifecycle state.

use crate::error::Error;
use crate::key::CacheKey;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle status of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Known to the store but never fetched.
    #[default]
    Idle,
    /// First fetch in flight, no data yet.
    Loading,
    /// Last settled fetch succeeded.
    Success,
    /// Last settled fetch failed. `data` may still hold older content.
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// Sequence token identifying one fetch of one key.
///
/// Tokens are drawn from one increasing counter, so they also increase per
/// key. Only the completion carrying the entry's current `in_flight` token is
/// applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchToken(pub(crate) u64);

impl FetchToken {
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FetchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable snapshot of one keyed dataset.
///
/// The store never mutates an entry in place; every transition builds a new
/// value and swaps it in, so a listener always sees a complete snapshot.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<Error>,
    pub fetched_at: Option<Instant>,
    pub stale_after: Duration,
    pub in_flight: Option<FetchToken>,
    /// Set by invalidation, cleared when a fetch starts.
    pub invalidated: bool,
    /// Bumped by the store on every write.
    pub revision: u64,
    pub updated_at: Instant,
}

impl CacheEntry {
    /// Fresh `Idle` entry with no data.
    pub fn new(key: CacheKey, stale_after: Duration) -> Self {
        CacheEntry {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            fetched_at: None,
            stale_after,
            in_flight: None,
            invalidated: false,
            revision: 0,
            updated_at: Instant::now(),
        }
    }

    /// Entry holding data that just arrived, as `setQueryData` would write it.
    pub fn with_data(key: CacheKey, data: Value, stale_after: Duration) -> Self {
        let now = Instant::now();
        CacheEntry {
            status: QueryStatus::Success,
            data: Some(data),
            fetched_at: Some(now),
            ..CacheEntry::new(key, stale_after)
        }
    }

    /// Whether `fetched_at + stale_after` has passed, or the entry was invalidated.
    pub fn is_stale(&self, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        match self.fetched_at {
            // A window past the clock's range never closes
            Some(at) => at
                .checked_add(self.stale_after)
                .is_some_and(|deadline| deadline <= now),
            None => true,
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Whether a read at `now` should go to the network.
    pub fn needs_fetch(&self, now: Instant) -> bool {
        match self.status {
            QueryStatus::Idle | QueryStatus::Loading | QueryStatus::Error => true,
            QueryStatus::Success => self.is_stale(now),
        }
    }

    /// Age used by garbage collection.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.updated_at)
    }
}
