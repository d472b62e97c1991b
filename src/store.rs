//! In-memory cache store (thread-safe, observer-aware).
//!
//! Uses DashMap for concurrent access with per-key sharding. Entries are
//! `Arc<CacheEntry>` snapshots that are swapped, never edited in place, and
//! every write notifies the key's listeners synchronously after the shard lock
//! is released.
//!
//! The store has no network knowledge. Fetching lives in
//! [`QueryExecutor`](crate::query::QueryExecutor).

use crate::entry::{CacheEntry, QueryStatus};
use crate::key::{CacheKey, KeyMatcher};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Callback invoked with the new snapshot whenever a subscribed entry changes.
///
/// Listeners run on the writer's stack. They must not block, and must not call
/// back into the store synchronously; spawn a task instead.
pub type Listener = Arc<dyn Fn(&Arc<CacheEntry>) + Send + Sync>;

/// Handle returned by [`CacheStore::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Store settings.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Staleness window for entries the store creates on subscription.
    pub default_stale_after: Duration,
    /// Unobserved entries older than this are evicted by [`CacheStore::gc`].
    pub gc_horizon: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            default_stale_after: Duration::ZERO,
            gc_horizon: Duration::from_secs(300),
        }
    }
}

struct Inner {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    listeners: DashMap<CacheKey, Vec<(SubscriptionId, Listener)>>,
    inactive_since: DashMap<CacheKey, Instant>,
    next_subscription: AtomicU64,
    config: StoreConfig,
    shutdown: watch::Sender<bool>,
}

/// Shared keyed cache with subscriptions.
///
/// Cloning is cheap and every clone addresses the same entries.
///
/// # Example
///
/// ```no_run
/// use query_kit::store::CacheStore;
/// use query_kit::CacheKey;
/// use serde_json::json;
///
/// let store = CacheStore::new();
/// let key = CacheKey::new("regions");
///
/// store.set_data(&key, json!([{"id": 1}]));
///
/// let undo = store
///     .patch(&key, |list| json!([{"id": "temp"}, list[0].clone()]))
///     .expect("entry has data");
///
/// // Server said no: roll back
/// undo.apply(&store);
/// assert_eq!(store.get(&key).unwrap().data, Some(json!([{"id": 1}])));
/// ```
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Create an empty store with default settings.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        CacheStore {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                listeners: DashMap::new(),
                inactive_since: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                config,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Current snapshot for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.inner.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Data of the current snapshot for `key`.
    pub fn get_data(&self, key: &CacheKey) -> Option<Value> {
        self.get(key).and_then(|e| e.data.clone())
    }

    /// Replace the entry stored under `entry.key`.
    pub fn put(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let key = entry.key.clone();
        let mut entry = Some(entry);
        // The closure always yields Some, so the write always happens.
        let written = self
            .update(&key, |_| entry.take())
            .unwrap_or_else(|| Arc::new(CacheEntry::new(key.clone(), Duration::ZERO)));
        debug!("✓ Store PUT {} (rev {})", key, written.revision);
        written
    }

    /// Write data as if a fetch had just succeeded.
    ///
    /// Clears any stored error and pending invalidation. An in-flight fetch is
    /// left alone and will overwrite this value when it lands.
    pub fn set_data(&self, key: &CacheKey, data: Value) -> Arc<CacheEntry> {
        let stale_after = self.inner.config.default_stale_after;
        let mut data = Some(data);
        self.update(key, |current| {
            let mut next = current
                .cloned()
                .unwrap_or_else(|| CacheEntry::new(key.clone(), stale_after));
            next.status = QueryStatus::Success;
            next.data = data.take();
            next.error = None;
            next.fetched_at = Some(Instant::now());
            next.invalidated = false;
            Some(next)
        })
        .unwrap_or_else(|| Arc::new(CacheEntry::new(key.clone(), stale_after)))
    }

    /// Apply a pure transform to the entry's data.
    ///
    /// Returns `None`, without writing, when the entry is absent or holds no
    /// data. Otherwise returns the [`Undo`] that reverses this patch.
    pub fn patch<F>(&self, key: &CacheKey, transform: F) -> Option<Undo>
    where
        F: FnOnce(&Value) -> Value,
    {
        let mut record = None;
        self.update(key, |current| {
            let current = current?;
            let previous = current.data.as_ref()?;
            let patched = transform(previous);
            record = Some(UndoRecord {
                key: key.clone(),
                previous: previous.clone(),
                patched: patched.clone(),
            });
            let mut next = current.clone();
            next.data = Some(patched);
            Some(next)
        })?;

        debug!("✓ Store PATCH {}", key);
        record.map(|r| Undo { records: vec![r] })
    }

    /// Patch every entry selected by `matcher` that holds data.
    ///
    /// Used for optimistic edits that must show on every page/filter
    /// combination of an entity kind.
    pub fn patch_matching<F>(&self, matcher: &KeyMatcher, transform: F) -> Undo
    where
        F: Fn(&Value) -> Value,
    {
        self.keys_matching(matcher)
            .iter()
            .filter_map(|key| self.patch(key, &transform))
            .fold(Undo::empty(), Undo::merge)
    }

    /// Mark every entry selected by `matcher` stale, keeping its data.
    ///
    /// Returns how many entries matched.
    pub fn invalidate(&self, matcher: &KeyMatcher) -> usize {
        let keys = self.keys_matching(matcher);
        for key in &keys {
            self.update(key, |current| {
                let current = current?;
                if current.invalidated {
                    return None;
                }
                let mut next = current.clone();
                next.invalidated = true;
                Some(next)
            });
        }

        debug!("✓ Store INVALIDATE {} ({} entries)", matcher, keys.len());
        keys.len()
    }

    /// Mark every entry stale.
    pub fn invalidate_all(&self) -> usize {
        let keys = self.keys();
        for key in &keys {
            self.update(key, |current| {
                let current = current.filter(|c| !c.invalidated)?;
                let mut next = current.clone();
                next.invalidated = true;
                Some(next)
            });
        }

        debug!("✓ Store INVALIDATE * ({} entries)", keys.len());
        keys.len()
    }

    /// Register interest in `key`.
    ///
    /// Creates an `Idle` entry when the key is unknown. The listener is called
    /// on every later change of the entry.
    pub fn subscribe(&self, key: &CacheKey, listener: Listener) -> SubscriptionId {
        let stale_after = self.inner.config.default_stale_after;
        self.update(key, |current| match current {
            Some(_) => None,
            None => Some(CacheEntry::new(key.clone(), stale_after)),
        });

        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, listener));
        self.inner.inactive_since.remove(key);

        debug!("✓ Store SUBSCRIBE {} ({:?})", key, id);
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    ///
    /// Does not cancel anything: an in-flight fetch for the key keeps running.
    pub fn unsubscribe(&self, key: &CacheKey, id: SubscriptionId) -> bool {
        let (removed, now_empty) = match self.inner.listeners.get_mut(key) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|(sub, _)| *sub != id);
                (subs.len() != before, subs.is_empty())
            }
            None => (false, false),
        };

        if now_empty {
            self.inner
                .listeners
                .remove_if(key, |_, subs| subs.is_empty());
            self.inner.inactive_since.insert(key.clone(), Instant::now());
        }

        if removed {
            debug!("✓ Store UNSUBSCRIBE {} ({:?})", key, id);
        }
        removed
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner.listeners.get(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Drop an entry. Subscriptions stay registered.
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let removed = self.inner.entries.remove(key).map(|(_, e)| e);
        self.inner.inactive_since.remove(key);
        if removed.is_some() {
            debug!("✓ Store REMOVE {}", key);
        }
        removed
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn keys_matching(&self, matcher: &KeyMatcher) -> Vec<CacheKey> {
        self.inner
            .entries
            .iter()
            .filter(|e| matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop every entry. Subscriptions stay registered.
    pub fn clear(&self) {
        self.inner.entries.clear();
        self.inner.inactive_since.clear();
        warn!("⚠ Store CLEAR executed - all entries dropped!");
    }

    /// Evict entries with no subscribers, no fetch in flight and an age past
    /// the GC horizon. Returns how many were evicted.
    ///
    /// Age counts from the later of the entry's last write and the moment its
    /// last subscriber left.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let horizon = self.inner.config.gc_horizon;
        let mut evicted = 0;

        for key in self.keys() {
            if self.subscriber_count(&key) > 0 {
                continue;
            }
            let idle_for = self
                .inner
                .inactive_since
                .get(&key)
                .map(|since| now.saturating_duration_since(*since));

            let removed = self.inner.entries.remove_if(&key, |_, entry| {
                let age = match idle_for {
                    Some(idle) => idle.min(entry.age(now)),
                    None => entry.age(now),
                };
                entry.in_flight.is_none() && age >= horizon
            });

            if removed.is_some() {
                self.inner.inactive_since.remove(&key);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!("✓ Store GC evicted {} entries", evicted);
        }
        evicted
    }

    /// Run [`gc`](Self::gc) every `every` on the current Tokio runtime until
    /// [`shutdown`](Self::shutdown) is called or the store is dropped.
    pub fn spawn_gc(&self, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        match weak.upgrade() {
                            Some(inner) => {
                                CacheStore { inner }.gc();
                            }
                            None => break,
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Store GC sweeper stopped");
        })
    }

    /// Stop background sweeping and drop every entry.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Store statistics.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            total_entries: 0,
            with_data: 0,
            fetching: 0,
            invalidated: 0,
            errored: 0,
            subscriptions: self.inner.listeners.iter().map(|s| s.len()).sum(),
        };
        for entry in self.inner.entries.iter() {
            stats.total_entries += 1;
            stats.with_data += usize::from(entry.has_data());
            stats.fetching += usize::from(entry.is_fetching());
            stats.invalidated += usize::from(entry.invalidated);
            stats.errored += usize::from(entry.status == QueryStatus::Error);
        }
        stats
    }

    /// Print store statistics to debug log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "Store Stats: {} entries ({} with data, {} fetching, {} invalidated, {} errored), {} subscriptions",
            stats.total_entries,
            stats.with_data,
            stats.fetching,
            stats.invalidated,
            stats.errored,
            stats.subscriptions
        );
    }

    /// Atomically derive the next snapshot for `key` and notify listeners.
    ///
    /// `derive` runs under the shard lock and receives the current entry, if
    /// any. Returning `None` leaves the store untouched and skips notification.
    pub(crate) fn update<F>(&self, key: &CacheKey, derive: F) -> Option<Arc<CacheEntry>>
    where
        F: FnOnce(Option<&CacheEntry>) -> Option<CacheEntry>,
    {
        let written = match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = Arc::clone(occupied.get());
                let derived = derive(Some(current.as_ref()))?;
                let next = Arc::new(stamp(derived, Some(current.as_ref())));
                occupied.insert(Arc::clone(&next));
                next
            }
            Entry::Vacant(vacant) => {
                let next = Arc::new(stamp(derive(None)?, None));
                vacant.insert(Arc::clone(&next));
                next
            }
        };

        self.notify(&written);
        Some(written)
    }

    fn notify(&self, entry: &Arc<CacheEntry>) {
        let listeners: Vec<Listener> = match self.inner.listeners.get(&entry.key) {
            Some(subs) => subs.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(entry);
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping every write performs on the snapshot it is about to publish.
fn stamp(mut next: CacheEntry, previous: Option<&CacheEntry>) -> CacheEntry {
    if let Some(previous) = previous {
        next.key = previous.key.clone();
        next.revision = previous.revision + 1;
    } else {
        next.revision = 1;
    }
    next.updated_at = Instant::now();
    next
}

/// Store statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    pub total_entries: usize,
    pub with_data: usize,
    pub fetching: usize,
    pub invalidated: usize,
    pub errored: usize,
    pub subscriptions: usize,
}

struct UndoRecord {
    key: CacheKey,
    previous: Value,
    patched: Value,
}

/// Reverses one or more [`CacheStore::patch`] calls.
///
/// A key is restored only while it still holds exactly what the patch wrote.
/// If anything rewrote the data since, restoring would clobber newer content,
/// so the key is invalidated instead and the next read fetches server truth.
/// Dropping an `Undo` discards it.
#[must_use = "dropping an Undo discards the rollback"]
#[derive(Default)]
pub struct Undo {
    records: Vec<UndoRecord>,
}

impl Undo {
    pub fn empty() -> Self {
        Undo::default()
    }

    /// Combine two undo handles. `other` is undone first on apply.
    pub fn merge(mut self, other: Undo) -> Undo {
        self.records.extend(other.records);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Keys touched by the patches this handle reverses.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.records.iter().map(|r| r.key.clone()).collect()
    }

    /// Roll the patches back. Returns how many keys were restored verbatim.
    pub fn apply(self, store: &CacheStore) -> usize {
        let mut restored = 0;

        for record in self.records.into_iter().rev() {
            let UndoRecord {
                key,
                previous,
                patched,
            } = record;
            let mut previous = Some(previous);
            let mut verbatim = false;

            store.update(&key, |current| {
                let current = current?;
                let mut next = current.clone();
                if current.data.as_ref() == Some(&patched) {
                    next.data = previous.take();
                    verbatim = true;
                } else {
                    next.invalidated = true;
                }
                Some(next)
            });

            if verbatim {
                restored += 1;
                debug!("✓ Store UNDO {}", key);
            } else {
                warn!("Store UNDO {} skipped: data changed since patch, invalidated", key);
            }
        }

        restored
    }
}

impl std::fmt::Debug for Undo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Undo").field("keys", &self.keys()).finish()
    }
}
