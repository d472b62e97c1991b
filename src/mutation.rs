//! Mutation executor - write operations that keep the cache coherent.
//!
//! A mutation may patch cached lists before the network call resolves
//! (optimistic update). On success the patch is kept, the server result is
//! reconciled into the cache and every affected prefix is invalidated. On
//! failure the patch is rolled back before the error is returned. Mutations
//! are never retried.

use crate::error::{Error, Result};
use crate::invalidation::InvalidationBus;
use crate::key::KeyMatcher;
use crate::observability::{LogMetrics, QueryMetrics};
use crate::query::FetchFuture;
use crate::store::{CacheStore, Undo};
use futures::future::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

type PerformFn<I> = Arc<dyn Fn(I) -> FetchFuture + Send + Sync>;
type OptimisticFn<I> = Arc<dyn Fn(&CacheStore, &I) -> Undo + Send + Sync>;
type ReconcileFn<I> = Arc<dyn Fn(&CacheStore, &I, &Value) + Send + Sync>;

/// How a create mutation shows the new row before the server confirms it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CreatePolicy {
    /// Only invalidate; the row appears after the refetch.
    #[default]
    Invalidate,
    /// Prepend a placeholder row with a temporary id, then invalidate.
    Optimistic,
}

/// A write operation and the cache keys it affects.
pub struct MutationDescriptor<I> {
    perform: PerformFn<I>,
    affects: Vec<KeyMatcher>,
    optimistic: Option<OptimisticFn<I>>,
    reconcile: Option<ReconcileFn<I>>,
}

impl<I> Clone for MutationDescriptor<I> {
    fn clone(&self) -> Self {
        MutationDescriptor {
            perform: Arc::clone(&self.perform),
            affects: self.affects.clone(),
            optimistic: self.optimistic.clone(),
            reconcile: self.reconcile.clone(),
        }
    }
}

impl<I: 'static> MutationDescriptor<I> {
    pub fn new<F, Fut>(perform: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        MutationDescriptor {
            perform: Arc::new(move |input| perform(input).boxed()),
            affects: Vec::new(),
            optimistic: None,
            reconcile: None,
        }
    }

    /// Invalidate keys selected by `matcher` once the mutation succeeds.
    pub fn affects(mut self, matcher: impl Into<KeyMatcher>) -> Self {
        self.affects.push(matcher.into());
        self
    }

    /// Patch the cache before the request is sent.
    ///
    /// The returned [`Undo`] is applied if the request fails.
    pub fn optimistic<F>(mut self, patch: F) -> Self
    where
        F: Fn(&CacheStore, &I) -> Undo + Send + Sync + 'static,
    {
        self.optimistic = Some(Arc::new(patch));
        self
    }

    /// Write the server's result into the cache before invalidation.
    pub fn reconcile<F>(mut self, reconcile: F) -> Self
    where
        F: Fn(&CacheStore, &I, &Value) + Send + Sync + 'static,
    {
        self.reconcile = Some(Arc::new(reconcile));
        self
    }

    pub fn affected(&self) -> &[KeyMatcher] {
        &self.affects
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic.is_some()
    }
}

impl<I> fmt::Debug for MutationDescriptor<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDescriptor")
            .field("affects", &self.affects)
            .field("optimistic", &self.optimistic.is_some())
            .field("reconcile", &self.reconcile.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct MutationExecutor {
    store: CacheStore,
    bus: InvalidationBus,
    metrics: Arc<dyn QueryMetrics>,
}

impl MutationExecutor {
    pub fn new(store: CacheStore, bus: InvalidationBus) -> Self {
        MutationExecutor {
            store,
            bus,
            metrics: Arc::new(LogMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn QueryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run one mutation.
    ///
    /// The optimistic patch is visible to every observer from before the
    /// request is sent until the request settles. On failure it is undone
    /// before this returns. If the returned future is dropped before the
    /// request settles, the patch is undone and the affected keys are
    /// invalidated, since the server may or may not have applied the write.
    pub async fn run<I>(&self, descriptor: &MutationDescriptor<I>, input: I) -> Result<Value>
    where
        I: Clone + Send + 'static,
    {
        let started = Instant::now();
        let undo = descriptor
            .optimistic
            .as_ref()
            .map(|patch| patch(&self.store, &input));

        if let Some(undo) = &undo {
            debug!("» Mutation optimistic patch on {} keys", undo.len());
        }
        let mut unsettled = Unsettled {
            store: &self.store,
            bus: &self.bus,
            affects: &descriptor.affects,
            undo,
            settled: false,
        };

        match (descriptor.perform)(input.clone()).await {
            Ok(value) => {
                // Keep the patch; invalidation below makes the next read replace it
                drop(unsettled.settle());
                if let Some(reconcile) = &descriptor.reconcile {
                    reconcile(&self.store, &input, &value);
                }
                let marked = self.bus.invalidate_many(descriptor.affects.iter().cloned());

                self.metrics.record_mutation(true, started.elapsed());
                info!(
                    "✓ Mutation succeeded, invalidated {} entries across {} prefixes",
                    marked,
                    descriptor.affects.len()
                );
                Ok(value)
            }
            Err(e) => {
                if let Some(undo) = unsettled.settle() {
                    let restored = undo.apply(&self.store);
                    debug!("✓ Mutation rolled back {} keys", restored);
                }

                self.metrics.record_mutation(false, started.elapsed());
                warn!("Mutation failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Rollback for a mutation whose future is dropped while the request is out.
struct Unsettled<'a> {
    store: &'a CacheStore,
    bus: &'a InvalidationBus,
    affects: &'a [KeyMatcher],
    undo: Option<Undo>,
    settled: bool,
}

impl Unsettled<'_> {
    /// Disarm the rollback and hand back the undo log.
    fn settle(&mut self) -> Option<Undo> {
        self.settled = true;
        self.undo.take()
    }
}

impl Drop for Unsettled<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let restored = self.undo.take().map_or(0, |undo| undo.apply(self.store));
        let marked = self.bus.invalidate_many(self.affects.iter().cloned());
        warn!(
            "Mutation dropped before settling, restored {} keys and invalidated {} entries",
            restored, marked
        );
    }
}

/// Lifecycle of a [`MutationHandle`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// Observable state of a [`MutationHandle`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationState {
    pub status: MutationStatus,
    pub data: Option<Value>,
    pub error: Option<Error>,
}

/// A mutation bound to an executor, with observable state for the view.
pub struct MutationHandle<I> {
    executor: MutationExecutor,
    descriptor: MutationDescriptor<I>,
    state: Arc<watch::Sender<MutationState>>,
}

impl<I> Clone for MutationHandle<I> {
    fn clone(&self) -> Self {
        MutationHandle {
            executor: self.executor.clone(),
            descriptor: self.descriptor.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<I: Clone + Send + 'static> MutationHandle<I> {
    pub fn new(executor: MutationExecutor, descriptor: MutationDescriptor<I>) -> Self {
        let (state, _) = watch::channel(MutationState::default());
        MutationHandle {
            executor,
            descriptor,
            state: Arc::new(state),
        }
    }

    pub async fn mutate(&self, input: I) -> Result<Value> {
        self.state.send_modify(|state| {
            state.status = MutationStatus::Pending;
            state.error = None;
        });
        let _pending = PendingState(&self.state);

        let result = self.executor.run(&self.descriptor, input).await;

        self.state.send_modify(|state| match &result {
            Ok(value) => {
                state.status = MutationStatus::Success;
                state.data = Some(value.clone());
            }
            Err(e) => {
                state.status = MutationStatus::Error;
                state.error = Some(e.clone());
            }
        });
        result
    }

    pub fn status(&self) -> MutationStatus {
        self.state.borrow().status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == MutationStatus::Pending
    }

    pub fn data(&self) -> Option<Value> {
        self.state.borrow().data.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.state.borrow().error.clone()
    }

    /// Back to `Idle`, forgetting the last result.
    pub fn reset(&self) {
        self.state.send_replace(MutationState::default());
    }

    pub fn watch(&self) -> watch::Receiver<MutationState> {
        self.state.subscribe()
    }
}

/// Drops a handle back to `Idle` if `mutate` is cancelled while pending.
struct PendingState<'a>(&'a watch::Sender<MutationState>);

impl Drop for PendingState<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if state.status != MutationStatus::Pending {
                return false;
            }
            state.status = MutationStatus::Idle;
            true
        });
    }
}

/// Pure list transforms for optimistic patches.
///
/// Each works on a bare JSON array or a page object holding the rows under
/// `content`. Other shapes are returned unchanged. Rows are matched on `id`.
pub mod patches {
    use serde_json::Value;
    use uuid::Uuid;

    /// Unique placeholder id for a row the server has not confirmed.
    pub fn temp_id() -> String {
        format!("temp-{}", Uuid::now_v7())
    }

    pub fn is_temp_id(id: &Value) -> bool {
        id.as_str().is_some_and(|s| s.starts_with("temp-"))
    }

    pub fn prepend_item(list: &Value, item: Value) -> Value {
        edit_rows(list, 1, |rows| rows.insert(0, item))
    }

    /// Replace the row with `id`. Object rows are merged field by field, so a
    /// partial update keeps the fields it does not mention.
    pub fn replace_item(list: &Value, id: &Value, item: Value) -> Value {
        edit_rows(list, 0, |rows| {
            for row in rows.iter_mut().filter(|row| row.get("id") == Some(id)) {
                match (row.as_object_mut(), item.as_object()) {
                    (Some(fields), Some(update)) => {
                        for (name, value) in update {
                            fields.insert(name.clone(), value.clone());
                        }
                    }
                    _ => *row = item.clone(),
                }
            }
        })
    }

    pub fn remove_item(list: &Value, id: &Value) -> Value {
        let removes = rows(list).map_or(0, |found| {
            found.iter().filter(|row| row.get("id") == Some(id)).count()
        });
        edit_rows(list, -(removes as i64), |rows| {
            rows.retain(|row| row.get("id") != Some(id))
        })
    }

    fn rows(list: &Value) -> Option<&Vec<Value>> {
        match list {
            Value::Array(rows) => Some(rows),
            Value::Object(page) => page.get("content").and_then(Value::as_array),
            _ => None,
        }
    }

    /// Apply `edit` to the rows and shift a page's `totalElements` by `delta`.
    fn edit_rows<F>(list: &Value, delta: i64, edit: F) -> Value
    where
        F: FnOnce(&mut Vec<Value>),
    {
        let mut next = list.clone();
        match &mut next {
            Value::Array(rows) => edit(rows),
            Value::Object(page) => {
                if let Some(Value::Array(rows)) = page.get_mut("content") {
                    edit(rows);
                    if let Some(total) = page.get("totalElements").and_then(Value::as_i64) {
                        page.insert("totalElements".to_string(), (total + delta).max(0).into());
                    }
                }
            }
            _ => {}
        }
        next
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKey;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn executor(store: &CacheStore) -> MutationExecutor {
        MutationExecutor::new(store.clone(), InvalidationBus::new(store.clone()))
    }

    fn seeded() -> (CacheStore, CacheKey) {
        let store = CacheStore::new();
        let key = CacheKey::new("regions");
        store.set_data(&key, json!([{"id": 1}, {"id": 2}]));
        (store, key)
    }

    fn optimistic_create(result: Result<Value>) -> MutationDescriptor<Value> {
        MutationDescriptor::new(move |_input: Value| {
            let result = result.clone();
            async move {
                tokio::task::yield_now().await;
                result
            }
        })
        .affects("regions")
        .optimistic(|store, input: &Value| {
            store.patch_matching(&KeyMatcher::prefix("regions"), |list| {
                patches::prepend_item(list, input.clone())
            })
        })
    }

    #[tokio::test]
    async fn test_success_keeps_patch_and_invalidates() {
        let (store, key) = seeded();
        let descriptor = optimistic_create(Ok(json!({"id": 3, "name": "X"})));

        let result = executor(&store)
            .run(&descriptor, json!({"id": "temp", "name": "X"}))
            .await;

        assert_eq!(result, Ok(json!({"id": 3, "name": "X"})));
        let entry = store.get(&key).expect("Entry not found");
        assert_eq!(
            entry.data,
            Some(json!([{"id": "temp", "name": "X"}, {"id": 1}, {"id": 2}]))
        );
        assert!(entry.invalidated);
    }

    #[tokio::test]
    async fn test_failure_restores_exact_list() {
        let (store, key) = seeded();
        let descriptor = optimistic_create(Err(Error::from_status(409, None)));

        let result = executor(&store)
            .run(&descriptor, json!({"id": "temp", "name": "X"}))
            .await;

        assert!(matches!(result, Err(Error::Client { status: 409, .. })));
        let entry = store.get(&key).expect("Entry not found");
        assert_eq!(entry.data, Some(json!([{"id": 1}, {"id": 2}])));
        assert!(!entry.invalidated);
    }

    #[tokio::test]
    async fn test_patch_visible_while_pending() {
        let (store, key) = seeded();
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));

        let descriptor = MutationDescriptor::new(move |_input: Value| {
            let gate = Arc::clone(&gate);
            async move {
                if let Some(gate) = gate.lock().await.take() {
                    let _ = gate.await;
                }
                Ok(json!({"id": 3}))
            }
        })
        .optimistic(|store, input: &Value| {
            store.patch_matching(&KeyMatcher::prefix("regions"), |list| {
                patches::prepend_item(list, input.clone())
            })
        });

        let executor = executor(&store);
        let pending = tokio::spawn(async move {
            executor.run(&descriptor, json!({"id": "temp"})).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let entry = store.get(&key).expect("Entry not found");
        assert_eq!(entry.data, Some(json!([{"id": "temp"}, {"id": 1}, {"id": 2}])));

        release.send(()).expect("Failed to release mutation");
        pending
            .await
            .expect("Mutation task panicked")
            .expect("Mutation failed");
    }

    #[tokio::test]
    async fn test_reconcile_runs_before_invalidation() {
        let (store, key) = seeded();
        let descriptor = MutationDescriptor::new(|id: i64| async move {
            Ok(json!({"id": id, "name": "Renamed"}))
        })
        .affects("regions")
        .reconcile(|store, id, saved| {
            let _ = store.patch(&CacheKey::new("regions"), |list| {
                patches::replace_item(list, &json!(*id), saved.clone())
            });
        });

        executor(&store)
            .run(&descriptor, 2)
            .await
            .expect("Mutation failed");

        let entry = store.get(&key).expect("Entry not found");
        assert_eq!(
            entry.data,
            Some(json!([{"id": 1}, {"id": 2, "name": "Renamed"}]))
        );
        assert!(entry.invalidated);
    }

    #[tokio::test]
    async fn test_mutations_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let descriptor = MutationDescriptor::new(move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Network("timeout".to_string())) }
        });

        let store = CacheStore::new();
        let result = executor(&store).run(&descriptor, ()).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_tracks_state() {
        let (store, _) = seeded();
        let descriptor = MutationDescriptor::new(|fail: bool| async move {
            if fail {
                Err(Error::from_status(500, Some("boom".to_string())))
            } else {
                Ok(json!({"ok": true}))
            }
        })
        .affects("regions");

        let handle = MutationHandle::new(executor(&store), descriptor);
        let states = handle.watch();
        assert_eq!(handle.status(), MutationStatus::Idle);

        handle.mutate(false).await.expect("Mutation failed");
        assert_eq!(handle.status(), MutationStatus::Success);
        assert_eq!(handle.data(), Some(json!({"ok": true})));
        assert!(states.has_changed().expect("Sender dropped"));

        assert!(handle.mutate(true).await.is_err());
        assert_eq!(handle.status(), MutationStatus::Error);
        assert_eq!(handle.error().and_then(|e| e.status()), Some(500));

        handle.reset();
        assert_eq!(handle.status(), MutationStatus::Idle);
        assert!(handle.error().is_none());
    }

    /// Optimistic create whose request takes 50ms to settle.
    fn slow_create() -> MutationDescriptor<Value> {
        MutationDescriptor::new(|_input: Value| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({"id": 3}))
        })
        .affects("regions")
        .optimistic(|store, input: &Value| {
            store.patch_matching(&KeyMatcher::prefix("regions"), |list| {
                patches::prepend_item(list, input.clone())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_mutation_rolls_back_patch() {
        let (store, key) = seeded();
        let descriptor = slow_create();
        let executor = executor(&store);

        let outcome = tokio::time::timeout(
            Duration::from_millis(5),
            executor.run(&descriptor, json!({"id": "temp"})),
        )
        .await;
        assert!(outcome.is_err());

        let entry = store.get(&key).expect("Entry not found");
        assert_eq!(entry.data, Some(json!([{"id": 1}, {"id": 2}])));
        assert!(entry.invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_mutate_returns_handle_to_idle() {
        let (store, key) = seeded();
        let handle = MutationHandle::new(executor(&store), slow_create());

        let outcome =
            tokio::time::timeout(Duration::from_millis(5), handle.mutate(json!({"id": "temp"})))
                .await;
        assert!(outcome.is_err());

        assert_eq!(handle.status(), MutationStatus::Idle);
        assert!(!handle.is_pending());
        let entry = store.get(&key).expect("Entry not found");
        assert_eq!(entry.data, Some(json!([{"id": 1}, {"id": 2}])));
    }
}
