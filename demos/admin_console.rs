//! Admin console walkthrough: a paginated, filtered discount table kept in
//! sync with its backend.
//!
//! Run with: RUST_LOG=debug cargo run --example admin_console

use query_kit::resource::draft;
use query_kit::transport::InMemoryTransport;
use query_kit::{ClientConfig, CreatePolicy, Error, Page, QueryClient, QueryParams, Resource, Result};
use serde_json::json;
use std::time::Duration;

fn print_page(label: &str, data: Option<&serde_json::Value>) -> Result<()> {
    let Some(data) = data else {
        println!("  {}: <no data>", label);
        return Ok(());
    };
    let page = Page::from_value(data)?;
    let ids: Vec<String> = page.content.iter().map(|row| row["id"].to_string()).collect();
    println!(
        "  {}: [{}] ({} rows, {} pages)",
        label,
        ids.join(", "),
        page.total_elements,
        page.total_pages
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║   Query-Kit Admin Console Example                      ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    // ========================================================================
    // Backend
    // ========================================================================

    let transport = InMemoryTransport::new();
    transport.seed(
        "/ann-discounts",
        (1..=23)
            .map(|id| json!({"id": id, "annTypesId": id % 3, "fixedDay": format!("{}", id % 28 + 1)}))
            .collect(),
    );
    transport.seed("/ann-types", vec![json!({"id": 1, "name": "Monthly"}), json!({"id": 2, "name": "Yearly"})]);
    transport.set_latency(Duration::from_millis(40));
    println!("📦 Backend seeded with 23 discounts and 2 types");

    let client = QueryClient::with_config(ClientConfig::default().with_gc_horizon(Duration::from_secs(120)));
    client.spawn_gc();

    let discounts = Resource::new("annDiscounts", "/ann-discounts");
    let types = Resource::new("annTypes", "/ann-types").sorted_by_id();

    // ========================================================================
    // Lookup table shared by every screen
    // ========================================================================

    println!("\n🔎 Loading lookup tables...");
    let lookup = types.list_query(&transport, QueryParams::new());
    let lookups = futures::future::join_all((0..3).map(|_| client.fetch_query(&lookup))).await;
    println!(
        "  ✓ 3 screens asked for types, backend served {} request(s)",
        transport.requests().len()
    );
    for lookup in lookups {
        lookup?;
    }

    // ========================================================================
    // Paginated list with filters
    // ========================================================================

    println!("\n📄 Opening the discount table...");
    let mut coordinator = client.use_pagination_filter(1, 10, [("annTypesId", 0)])?;
    let mut table = client.observe(discounts.list_query(&transport, coordinator.params()));
    let first = table.settled().await;
    print_page("page 1", first.data.as_ref())?;

    coordinator.next_page(Page::from_value(first.data.as_ref().unwrap_or(&json!([])))?.total_pages);
    table.set_params(coordinator.params());
    print_page("page 2 (placeholder)", table.result().data.as_ref())?;
    print_page("page 2", table.settled().await.data.as_ref())?;

    coordinator.set_filter("annTypesId", 2);
    table.set_params(coordinator.params());
    println!("  ✓ Filter annTypesId=2 applied, back on page {}", coordinator.page());
    print_page("filtered", table.settled().await.data.as_ref())?;

    // ========================================================================
    // Writes
    // ========================================================================

    println!("\n✍️  Creating a discount optimistically...");
    let create = client.use_mutation(discounts.create(&transport, CreatePolicy::Optimistic));
    let pending = tokio::spawn({
        let create = create.clone();
        async move { create.mutate(draft(json!({"annTypesId": 2, "fixedDay": "30"}))).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    print_page("while saving", table.result().data.as_ref())?;

    let created = pending
        .await
        .map_err(|e| Error::Other(format!("create task failed: {}", e)))??;
    println!("  ✓ Server assigned id {}", created["id"]);
    print_page("after refetch", table.settled().await.data.as_ref())?;

    println!("\n🗑️  Deleting a discount the server refuses to delete...");
    transport.fail_next(Error::from_status(409, Some("discount in use".to_string())));
    let delete = client.use_mutation(discounts.delete(&transport, true));
    match delete.mutate(json!(2)).await {
        Ok(_) => println!("  ✗ Delete unexpectedly succeeded"),
        Err(e) => println!("  ✓ Delete refused ({}), row restored", e),
    }
    print_page("after rollback", table.result().data.as_ref())?;

    // ========================================================================
    // Summary
    // ========================================================================

    let stats = client.stats();
    println!("\n📊 Cache summary");
    println!("  entries:       {}", stats.total_entries);
    println!("  with data:     {}", stats.with_data);
    println!("  subscriptions: {}", stats.subscriptions);
    println!("  requests:      {}", transport.requests().len());

    drop(table);
    client.shutdown();
    println!("\n✅ Done");
    Ok(())
}
