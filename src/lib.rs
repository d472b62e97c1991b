//! # query-kit
//!
//! A keyed query cache for admin consoles and other CRUD front ends.
//!
//! ## Features
//!
//! - **Keyed datasets:** entity kind plus view parameters, compared structurally
//! - **Request dedup:** concurrent reads of one key share a single fetch
//! - **Stale-while-revalidate:** cached data is served at once and refreshed behind it
//! - **Optimistic mutations:** cached lists are patched before the server answers
//!   and rolled back if it refuses
//! - **Prefix invalidation:** one write marks every page and filter of its kind stale
//! - **Out-of-order safety:** a slow older response never overwrites a newer one
//! - **Transport agnostic:** plug any backend in through [`Transport`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use query_kit::{CreatePolicy, QueryClient, Resource};
//! use query_kit::transport::InMemoryTransport;
//! use serde_json::json;
//!
//! let client = QueryClient::new();
//! let transport = InMemoryTransport::new();
//! transport.seed("/ann-discounts", vec![json!({"id": 1, "annTypesId": 2})]);
//!
//! let discounts = Resource::new("annDiscounts", "/ann-discounts");
//!
//! // 1. Fold page and filters into the key
//! let mut coordinator = client.use_pagination_filter(1, 10, [("annTypesId", 0)])?;
//!
//! // 2. Observe the list (useQuery)
//! let mut list = client.observe(discounts.list_query(&transport, coordinator.params()));
//! let page = list.settled().await;
//!
//! // 3. Change filters: back to page 1, previous rows shown as placeholder
//! coordinator.set_filter("annTypesId", 2);
//! list.set_params(coordinator.params());
//!
//! // 4. Write (useMutation): optimistic row, invalidation, refetch
//! let create = client.use_mutation(discounts.create(&transport, CreatePolicy::Optimistic));
//! create.mutate(json!({"annTypesId": 2, "fixedDay": "30"})).await?;
//! ```

#[macro_use]
extern crate log;

pub mod client;
pub mod entry;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod mutation;
pub mod observability;
pub mod observer;
pub mod pagination;
pub mod query;
pub mod resource;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientConfig, QueryClient};
pub use entry::{CacheEntry, FetchToken, QueryStatus};
pub use error::{Error, Result};
pub use invalidation::{InvalidationBus, InvalidationEvent};
pub use key::{CacheKey, KeyMatcher, ParamValue, QueryParams};
pub use mutation::{
    CreatePolicy, MutationDescriptor, MutationExecutor, MutationHandle, MutationState,
    MutationStatus,
};
pub use observer::{ObserverOptions, QueryObserver, QueryResult};
pub use pagination::PaginationFilter;
pub use query::{QueryDescriptor, QueryExecutor};
pub use resource::{Page, Resource};
pub use store::{CacheStore, Undo};
pub use transport::{Request, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
