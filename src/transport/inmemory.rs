//! In-memory transport emulating the console's conventional endpoints.
//!
//! Each entity kind lives under a base path with four routes:
//!
//! | Route | Method | Answer |
//! |-------|--------|--------|
//! | `{base}/read` | GET | rows, or a page when `page`/`size` are given |
//! | `{base}/create` | POST | the created row with its assigned `id` |
//! | `{base}/update/{id}` | PUT | the updated row |
//! | `{base}/delete/{id}` | DELETE | the deleted row |
//!
//! Every answer is wrapped as `{"data": ...}`. Pages have the shape
//! `{content, totalPages, totalElements, page, size}` with 1-based pages.
//! Query parameters other than `page`, `size` and `search` filter on equality;
//! `search` matches a substring of any string field, case-insensitively.

use super::{Method, Request, Transport};
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const PAGING_PARAMS: [&str; 3] = ["page", "size", "search"];

struct Inner {
    tables: DashMap<String, Vec<Value>>,
    next_id: AtomicI64,
    latency_ms: AtomicU64,
    failures: Mutex<VecDeque<Error>>,
    requests: Mutex<Vec<Request>>,
}

/// Thread-safe in-memory backend for tests and demos.
///
/// # Example
///
/// ```no_run
/// use query_kit::transport::{InMemoryTransport, Request, Transport};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> query_kit::Result<()> {
///     let transport = InMemoryTransport::new();
///     transport.seed("/regions", vec![json!({"id": 1, "name": "North"})]);
///
///     let body = transport.request(Request::get("/regions/read")).await?;
///     assert_eq!(body["data"][0]["name"], "North");
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        InMemoryTransport {
            inner: Arc::new(Inner {
                tables: DashMap::new(),
                next_id: AtomicI64::new(1),
                latency_ms: AtomicU64::new(0),
                failures: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replace the rows served under `base`.
    ///
    /// Created rows get ids above the largest numeric id seeded so far.
    pub fn seed(&self, base: impl Into<String>, rows: Vec<Value>) {
        let max_id = rows.iter().filter_map(|r| r.get("id")?.as_i64()).max().unwrap_or(0);
        self.inner.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        self.inner.tables.insert(base.into(), rows);
    }

    /// Current rows under `base`, in storage order.
    pub fn rows(&self, base: &str) -> Vec<Value> {
        self.inner
            .tables
            .get(base)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// Delay every answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next request fail with `error`. Queued failures are used in order.
    pub fn fail_next(&self, error: Error) {
        lock(&self.inner.failures).push_back(error);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.inner.requests).clone()
    }

    /// Number of requests received for `method` on `path`.
    pub fn request_count(&self, method: Method, path: &str) -> usize {
        lock(&self.inner.requests)
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn clear_requests(&self) {
        lock(&self.inner.requests).clear();
    }

    fn handle(&self, request: &Request) -> Result<Value> {
        let route = Route::parse(&request.path)
            .ok_or_else(|| Error::from_status(404, Some(format!("no route {}", request.path))))?;

        let expected = match route.action {
            Action::Read => Method::Get,
            Action::Create => Method::Post,
            Action::Update(_) => Method::Put,
            Action::Delete(_) => Method::Delete,
        };
        if request.method != expected {
            return Err(Error::from_status(405, Some(format!("{} not allowed", request.method))));
        }

        let mut table = self
            .inner
            .tables
            .get_mut(route.base)
            .ok_or_else(|| Error::from_status(404, Some(format!("unknown resource {}", route.base))))?;

        let data = match route.action {
            Action::Read => read(&table, request)?,
            Action::Create => {
                let mut row = object_body(request)?;
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                row.insert("id".to_string(), json!(id));
                let row = Value::Object(row);
                table.push(row.clone());
                row
            }
            Action::Update(id) => {
                let update = object_body(request)?;
                let row = table
                    .iter_mut()
                    .find(|row| id_matches(row, id))
                    .ok_or_else(|| not_found(id))?;
                if let Value::Object(fields) = row {
                    for (name, value) in update {
                        if name != "id" {
                            fields.insert(name, value);
                        }
                    }
                }
                row.clone()
            }
            Action::Delete(id) => {
                let position = table
                    .iter()
                    .position(|row| id_matches(row, id))
                    .ok_or_else(|| not_found(id))?;
                table.remove(position)
            }
        };

        Ok(json!({ "data": data }))
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for InMemoryTransport {
    async fn request(&self, request: Request) -> Result<Value> {
        lock(&self.inner.requests).push(request.clone());

        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let injected = lock(&self.inner.failures).pop_front();
        let result = match injected {
            Some(error) => Err(error),
            None => self.handle(&request),
        };

        match &result {
            Ok(_) => debug!("✓ Transport {}", request),
            Err(e) => debug!("✗ Transport {}: {}", request, e),
        }
        result
    }
}

enum Action<'a> {
    Read,
    Create,
    Update(&'a str),
    Delete(&'a str),
}

struct Route<'a> {
    base: &'a str,
    action: Action<'a>,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        if let Some(base) = path.strip_suffix("/read") {
            return Some(Route {
                base,
                action: Action::Read,
            });
        }
        if let Some(base) = path.strip_suffix("/create") {
            return Some(Route {
                base,
                action: Action::Create,
            });
        }

        let (rest, id) = path.rsplit_once('/')?;
        if let Some(base) = rest.strip_suffix("/update") {
            return Some(Route {
                base,
                action: Action::Update(id),
            });
        }
        rest.strip_suffix("/delete").map(|base| Route {
            base,
            action: Action::Delete(id),
        })
    }
}

fn read(rows: &[Value], request: &Request) -> Result<Value> {
    let search = request
        .query_value("search")
        .map(str::to_lowercase)
        .filter(|s| !s.is_empty());

    let matching: Vec<Value> = rows
        .iter()
        .filter(|row| {
            request
                .query
                .iter()
                .filter(|(name, _)| !PAGING_PARAMS.contains(&name.as_str()))
                .all(|(name, value)| row.get(name).is_some_and(|field| scalar_eq(field, value)))
        })
        .filter(|row| match &search {
            Some(needle) => contains_text(row, needle),
            None => true,
        })
        .cloned()
        .collect();

    let page = positive(request, "page")?;
    let size = positive(request, "size")?;
    if page.is_none() && size.is_none() {
        return Ok(Value::Array(matching));
    }

    let page = page.unwrap_or(1);
    let size = size.unwrap_or(10);
    let total = matching.len();
    let total_pages = total.div_ceil(size);
    let content: Vec<Value> = matching
        .into_iter()
        .skip((page - 1).saturating_mul(size))
        .take(size)
        .collect();

    Ok(json!({
        "content": content,
        "totalPages": total_pages,
        "totalElements": total,
        "page": page,
        "size": size,
    }))
}

fn positive(request: &Request, name: &str) -> Result<Option<usize>> {
    match request.query_value(name) {
        None => Ok(None),
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(Error::from_status(400, Some(format!("invalid {}: {}", name, raw)))),
        },
    }
}

fn scalar_eq(field: &Value, raw: &str) -> bool {
    match field {
        Value::String(s) => s == raw,
        Value::Number(n) => n.to_string() == raw,
        Value::Bool(b) => b.to_string() == raw,
        _ => false,
    }
}

fn contains_text(row: &Value, needle: &str) -> bool {
    row.as_object().is_some_and(|fields| {
        fields
            .values()
            .filter_map(Value::as_str)
            .any(|text| text.to_lowercase().contains(needle))
    })
}

fn id_matches(row: &Value, id: &str) -> bool {
    row.get("id").is_some_and(|field| scalar_eq(field, id))
}

fn not_found(id: &str) -> Error {
    Error::from_status(404, Some(format!("no row with id {}", id)))
}

fn object_body(request: &Request) -> Result<Map<String, Value>> {
    match &request.body {
        Some(Value::Object(fields)) => Ok(fields.clone()),
        _ => Err(Error::from_status(400, Some("expected a JSON object body".to_string()))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
