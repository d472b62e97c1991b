//! Integration tests for query-kit
//!
//! These tests verify end-to-end behaviour across the store, executors,
//! observers and the in-memory transport.

use query_kit::observability::StalePolicy;
use query_kit::transport::{InMemoryTransport, Method};
use query_kit::{
    CacheKey, ClientConfig, CreatePolicy, Error, PaginationFilter, QueryClient, QueryDescriptor,
    QueryParams, Resource,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn regions_transport() -> InMemoryTransport {
    let transport = InMemoryTransport::new();
    transport.seed("/regions", vec![json!({"id": 1}), json!({"id": 2})]);
    transport
}

fn discounts_transport(rows: i64) -> InMemoryTransport {
    let transport = InMemoryTransport::new();
    transport.seed(
        "/ann-discounts",
        (1..=rows)
            .map(|id| json!({"id": id, "annTypesId": if id % 3 == 0 { 2 } else { 1 }}))
            .collect(),
    );
    transport
}

fn ids(value: &Value) -> Vec<Value> {
    let rows = match value.get("content") {
        Some(content) => content.as_array(),
        None => value.as_array(),
    };
    rows.map(|rows| rows.iter().map(|row| row["id"].clone()).collect())
        .unwrap_or_default()
}

/// Test 1: Request Dedup
///
/// Ten concurrent reads of one key reach the backend once.
#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_request() {
    let client = QueryClient::new();
    let transport = regions_transport();
    transport.set_latency(Duration::from_millis(20));
    let descriptor = Resource::new("regions", "/regions").list_query(&transport, QueryParams::new());

    let results =
        futures::future::join_all((0..10).map(|_| client.fetch_query(&descriptor))).await;

    assert_eq!(transport.request_count(Method::Get, "/regions/read"), 1);
    assert!(results.iter().all(|r| r.is_ok()));
}

/// Test 2: Invalidation Forces One Fetch
///
/// Fresh data that gets invalidated is fetched again exactly once.
#[tokio::test(start_paused = true)]
async fn test_invalidate_then_read_fetches_once() {
    let client = QueryClient::with_config(
        ClientConfig::default().with_stale_policy(StalePolicy::Fixed(Duration::from_secs(600))),
    );
    let transport = regions_transport();
    let descriptor = Resource::new("regions", "/regions").list_query(&transport, QueryParams::new());

    client.fetch_query(&descriptor).await.expect("Failed to fetch");
    client.fetch_query(&descriptor).await.expect("Failed to fetch");
    assert_eq!(transport.request_count(Method::Get, "/regions/read"), 1);

    client.invalidate("regions");
    let (a, b) =
        futures::future::join(client.fetch_query(&descriptor), client.fetch_query(&descriptor))
            .await;
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(transport.request_count(Method::Get, "/regions/read"), 2);
}

/// Test 3: Optimistic Create
///
/// The placeholder row shows immediately and is gone after the refetch the
/// invalidation triggers.
#[tokio::test(start_paused = true)]
async fn test_optimistic_create_round_trip() {
    let client = QueryClient::new();
    let transport = regions_transport();
    let regions = Resource::new("regions", "/regions");
    let key = regions.key(QueryParams::new());

    let observer = client.observe(regions.list_query(&transport, QueryParams::new()));
    let loaded = observer.settled().await;
    assert_eq!(loaded.data, Some(json!([{"id": 1}, {"id": 2}])));

    transport.set_latency(Duration::from_millis(50));
    let create = client.use_mutation(regions.create(&transport, CreatePolicy::Optimistic));
    let pending = tokio::spawn({
        let create = create.clone();
        async move { create.mutate(json!({"id": "temp", "name": "X"})).await }
    });

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(create.is_pending());
    assert_eq!(
        client.get_query_data(&key),
        Some(json!([{"id": "temp", "name": "X"}, {"id": 1}, {"id": 2}]))
    );

    let created = pending
        .await
        .expect("Mutation task panicked")
        .expect("Mutation failed");
    assert_eq!(created["name"], "X");

    let refreshed = observer.settled().await;
    assert_eq!(
        refreshed.data,
        Some(json!([{"id": 1}, {"id": 2}, {"id": 3, "name": "X"}]))
    );
}

/// Test 4: Failed Mutation Rollback
///
/// A refused create leaves the cached list exactly as it was.
#[tokio::test(start_paused = true)]
async fn test_failed_create_restores_list() {
    let client = QueryClient::new();
    let transport = regions_transport();
    let regions = Resource::new("regions", "/regions");
    let key = regions.key(QueryParams::new());

    let observer = client.observe(regions.list_query(&transport, QueryParams::new()));
    observer.settled().await;

    transport.fail_next(Error::from_status(500, Some("duplicate".to_string())));
    let create = client.use_mutation(regions.create(&transport, CreatePolicy::Optimistic));
    let result = create.mutate(json!({"id": "temp", "name": "X"})).await;

    assert!(matches!(result, Err(Error::Server { status: 500, .. })));
    assert_eq!(client.get_query_data(&key), Some(json!([{"id": 1}, {"id": 2}])));
    assert_eq!(create.error().and_then(|e| e.status()), Some(500));
    assert_eq!(transport.rows("/regions").len(), 2);
}

/// Test 5: Filter Change Resets Page
#[test]
fn test_filter_change_resets_page() {
    let mut coordinator =
        PaginationFilter::new(3, 10, [("type", 0)]).expect("Failed to create coordinator");
    coordinator.set_filters([("type", 2)]);

    assert_eq!(coordinator.page(), 1);
    assert_eq!(
        coordinator.key("annTypes"),
        CacheKey::new("annTypes")
            .param("page", 1)
            .param("size", 10)
            .param("type", 2)
    );
}

/// Test 6: Stale-While-Revalidate
///
/// A stale read returns the old rows at once; the observer then sees the new ones.
#[tokio::test(start_paused = true)]
async fn test_stale_read_returns_old_data_then_notifies() {
    let client = QueryClient::with_config(
        ClientConfig::default().with_stale_policy(StalePolicy::Fixed(Duration::from_secs(10))),
    );
    let transport = regions_transport();
    let descriptor = Resource::new("regions", "/regions").list_query(&transport, QueryParams::new());

    let observer = client.observe(descriptor.clone());
    observer.settled().await;

    transport.seed("/regions", vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 9})]);
    transport.set_latency(Duration::from_millis(30));
    tokio::time::advance(Duration::from_secs(11)).await;

    let entry = client.queries().resolve(&descriptor).await;
    assert_eq!(entry.data, Some(json!([{"id": 1}, {"id": 2}])));
    assert!(entry.is_fetching());

    let refreshed = observer.settled().await;
    assert_eq!(ids(refreshed.data.as_ref().expect("No data")), vec![json!(1), json!(2), json!(9)]);
    assert!(!refreshed.is_stale);
}

/// Test 7: Out-Of-Order Responses
///
/// A slow response from an older fetch never replaces a newer one.
#[tokio::test(start_paused = true)]
async fn test_older_slow_response_is_discarded() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let descriptor = QueryDescriptor::new(CacheKey::new("areas"), move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let (delay, body) = if n == 0 { (100, "A") } else { (10, "B") };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!(body))
        }
    });

    let first = tokio::spawn({
        let client = client.clone();
        let descriptor = descriptor.clone();
        async move { client.queries().resolve(&descriptor).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    let second = client.queries().refetch(&descriptor).await;
    assert_eq!(second.data, Some(json!("B")));

    let first = first.await.expect("Resolve task panicked");
    assert_eq!(first.data, Some(json!("B")));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.get_query_data(descriptor.key()), Some(json!("B")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test 8: Shared Failure
///
/// Callers that joined a failed fetch receive the deduped error.
#[tokio::test(start_paused = true)]
async fn test_joined_waiters_share_failure() {
    let client = QueryClient::new();
    let transport = regions_transport();
    transport.set_latency(Duration::from_millis(5));
    transport.fail_next(Error::Network("timed out".to_string()));
    let descriptor = Resource::new("regions", "/regions").list_query(&transport, QueryParams::new());

    let (first, second) =
        futures::future::join(client.fetch_query(&descriptor), client.fetch_query(&descriptor))
            .await;

    assert_eq!(first, Err(Error::Network("timed out".to_string())));
    let second = second.expect_err("Joined waiter should fail");
    assert!(matches!(second, Error::Deduped(_)));
    assert_eq!(second.root(), &Error::Network("timed out".to_string()));
    assert!(second.is_retryable());
}

/// Test 9: Undo After Fetch
///
/// Rolling back after server data landed invalidates instead of clobbering it.
#[tokio::test]
async fn test_undo_after_fetch_keeps_server_data() {
    let client = QueryClient::new();
    let key = CacheKey::new("categories");
    client.set_query_data(&key, json!([{"id": 1}]));

    let undo = client
        .update_query_data(&key, |_| json!([{"id": "temp"}, {"id": 1}]))
        .expect("Entry has data");
    client.set_query_data(&key, json!([{"id": 1}, {"id": 5}]));

    assert_eq!(undo.apply(client.store()), 0);
    let entry = client.store().get(&key).expect("Entry not found");
    assert_eq!(entry.data, Some(json!([{"id": 1}, {"id": 5}])));
    assert!(entry.invalidated);
}

/// Test 10: Garbage Collection
///
/// Only unobserved entries past the horizon are evicted.
#[tokio::test(start_paused = true)]
async fn test_gc_evicts_only_unobserved_old_entries() {
    let client = QueryClient::with_config(
        ClientConfig::default().with_gc_horizon(Duration::from_secs(60)),
    );
    let transport = regions_transport();
    let regions = Resource::new("regions", "/regions");

    let observer = client.observe(regions.list_query(&transport, QueryParams::new()));
    observer.settled().await;
    client.set_query_data(&CacheKey::new("jobTypes"), json!([]));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(client.gc(), 1);
    assert!(client.get_query_data(&CacheKey::new("jobTypes")).is_none());
    assert!(client.get_query_data(observer.key()).is_some());

    let key = observer.key().clone();
    drop(observer);
    assert_eq!(client.gc(), 0);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(client.gc(), 1);
    assert!(client.store().get(&key).is_none());
}

/// Test 11: Keep Previous Data Across Pages
#[tokio::test(start_paused = true)]
async fn test_page_change_shows_placeholder() {
    let client = QueryClient::new();
    let transport = discounts_transport(25);
    transport.set_latency(Duration::from_millis(20));
    let discounts = Resource::new("annDiscounts", "/ann-discounts");
    let mut coordinator = client
        .use_pagination_filter(1, 10, Vec::<(String, i64)>::new())
        .expect("Failed to create coordinator");

    let mut list = client.observe(discounts.list_query(&transport, coordinator.params()));
    let first = list.settled().await;
    let first_ids = ids(first.data.as_ref().expect("No data"));
    assert_eq!(first_ids.len(), 10);

    assert!(coordinator.next_page(3));
    list.set_params(coordinator.params());
    let moving = list.result();
    assert!(moving.is_placeholder);
    assert_eq!(ids(moving.data.as_ref().expect("No data")), first_ids);

    let second = list.settled().await;
    assert!(!second.is_placeholder);
    let data = second.data.expect("No data");
    assert_eq!(data["page"], 2);
    assert_eq!(ids(&data)[0], json!(11));
}

/// Test 12: Prefix Invalidation Across Pages
///
/// A delete refreshes every cached page of the entity kind.
#[tokio::test(start_paused = true)]
async fn test_delete_refreshes_every_page() {
    let client = QueryClient::new();
    let transport = discounts_transport(15);
    let discounts = Resource::new("annDiscounts", "/ann-discounts");

    let page_one = client.observe(
        discounts.list_query(&transport, QueryParams::new().with("page", 1).with("size", 10)),
    );
    let page_two = client.observe(
        discounts.list_query(&transport, QueryParams::new().with("page", 2).with("size", 10)),
    );
    page_one.settled().await;
    let before = page_two.settled().await;
    assert_eq!(ids(before.data.as_ref().expect("No data"))[0], json!(11));

    let delete = client.use_mutation(discounts.delete(&transport, true));
    delete.mutate(json!(3)).await.expect("Failed to delete");

    let first = page_one.settled().await;
    let second = page_two.settled().await;
    assert!(!ids(first.data.as_ref().expect("No data")).contains(&json!(3)));
    assert_eq!(ids(second.data.as_ref().expect("No data"))[0], json!(12));
    assert_eq!(first.data.expect("No data")["totalElements"], 14);
}

/// Test 13: Filtered Views Share Inactive Filters
///
/// `{annTypesId: 0}` and no filter address one entry and one request.
#[tokio::test(start_paused = true)]
async fn test_inactive_filter_shares_entry() {
    let client = QueryClient::with_config(
        ClientConfig::default().with_stale_policy(StalePolicy::Fixed(Duration::from_secs(60))),
    );
    let transport = discounts_transport(6);
    let discounts = Resource::new("annDiscounts", "/ann-discounts");

    let with_zero = discounts.list_query(&transport, QueryParams::new().with("annTypesId", 0));
    let without = discounts.list_query(&transport, QueryParams::new());
    assert_eq!(with_zero.key(), without.key());

    client.fetch_query(&with_zero).await.expect("Failed to fetch");
    let data = client.fetch_query(&without).await.expect("Failed to fetch");

    assert_eq!(ids(&data).len(), 6);
    let reads = transport.requests();
    assert_eq!(reads.len(), 1);
    assert!(reads[0].query.is_empty());
}
