//! Conventional CRUD endpoints for one entity kind.
//!
//! Every entity kind of the console follows the same layout under a base path
//! (`/regions`, `/ann-discounts`, ...) and answers inside a `{"data": ...}`
//! envelope. A [`Resource`] builds the query and mutation descriptors for one
//! such kind, so views only pick parameters and policies.

use crate::error::{Error, Result};
use crate::key::{CacheKey, KeyMatcher, ParamValue, QueryParams};
use crate::mutation::{patches, CreatePolicy, MutationDescriptor};
use crate::query::QueryDescriptor;
use crate::store::Undo;
use crate::transport::{Request, Transport};
use serde_json::Value;
use std::cmp::Ordering;

/// Take `body.data` when present, else the body itself.
pub fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut fields) if fields.contains_key("data") => {
            fields.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Sort rows by numeric `id`, rows without one last.
pub fn sort_by_id(list: Value) -> Value {
    fn id(row: &Value) -> Option<i64> {
        row.get("id").and_then(Value::as_i64)
    }

    match list {
        Value::Array(mut rows) => {
            rows.sort_by(|a, b| match (id(a), id(b)) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
            Value::Array(rows)
        }
        other => other,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    prefix: String,
    base_path: String,
    sort_by_id: bool,
}

impl Resource {
    /// `prefix` names the cache keys, `base_path` the endpoints.
    pub fn new(prefix: impl Into<String>, base_path: impl Into<String>) -> Self {
        Resource {
            prefix: prefix.into(),
            base_path: base_path.into().trim_end_matches('/').to_string(),
            sort_by_id: false,
        }
    }

    /// Sort list results by `id` after fetching.
    pub fn sorted_by_id(mut self) -> Self {
        self.sort_by_id = true;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn key(&self, params: QueryParams) -> CacheKey {
        CacheKey::with_params(self.prefix.clone(), params)
    }

    /// Matcher over every cached view of this kind.
    pub fn matcher(&self) -> KeyMatcher {
        KeyMatcher::prefix(self.prefix.clone())
    }

    pub fn read_path(&self) -> String {
        format!("{}/read", self.base_path)
    }

    pub fn create_path(&self) -> String {
        format!("{}/create", self.base_path)
    }

    pub fn update_path(&self, id: &Value) -> String {
        format!("{}/update/{}", self.base_path, id_segment(id))
    }

    pub fn delete_path(&self, id: &Value) -> String {
        format!("{}/delete/{}", self.base_path, id_segment(id))
    }

    /// List query for `params`. The key's active parameters become the query
    /// string, so the descriptor follows an observer across pages.
    pub fn list_query<T: Transport>(&self, transport: &T, params: QueryParams) -> QueryDescriptor {
        let read_path = self.read_path();
        let transport = transport.clone();
        let sort = self.sort_by_id;

        QueryDescriptor::keyed(self.key(params), move |key| {
            let transport = transport.clone();
            let request = Request::get(read_path.clone()).params(key.params());
            async move {
                let data = unwrap_envelope(transport.request(request).await?);
                Ok(if sort { sort_by_id(data) } else { data })
            }
        })
    }

    /// Create mutation taking the new row as input.
    ///
    /// With [`CreatePolicy::Optimistic`] the row is prepended before the
    /// request, under a temporary id unless it carries one. Only first pages
    /// whose filters and search the row satisfies show it; other cached views
    /// wait for the refetch.
    /// Rows built with [`draft`] keep their temporary id across the call, so
    /// the placeholder is swapped for the server row when it answers. The kind
    /// is invalidated either way.
    pub fn create<T: Transport>(&self, transport: &T, policy: CreatePolicy) -> MutationDescriptor<Value> {
        let transport = transport.clone();
        let path = self.create_path();
        let matcher = self.matcher();

        let descriptor = MutationDescriptor::new(move |row: Value| {
            let transport = transport.clone();
            let request = Request::post(path.clone(), without_temp_id(row));
            async move { transport.request(request).await.map(unwrap_envelope) }
        })
        .affects(matcher.clone());

        match policy {
            CreatePolicy::Invalidate => descriptor,
            CreatePolicy::Optimistic => {
                let reconcile_matcher = matcher.clone();
                descriptor
                    .optimistic(move |store, row: &Value| {
                        let row = with_temp_id(row);
                        store
                            .keys_matching(&matcher)
                            .into_iter()
                            .filter(|key| shows_new_row(key, &row))
                            .filter_map(|key| {
                                store.patch(&key, |list| patches::prepend_item(list, row.clone()))
                            })
                            .fold(Undo::empty(), Undo::merge)
                    })
                    .reconcile(move |store, row: &Value, saved: &Value| {
                        let Some(temp) = row.get("id").filter(|id| patches::is_temp_id(id)) else {
                            return;
                        };
                        let swapped = store.patch_matching(&reconcile_matcher, |list| {
                            patches::replace_item(list, temp, saved.clone())
                        });
                        debug!("✓ Reconciled {} with {} cached views", temp, swapped.len());
                    })
            }
        }
    }

    /// Update mutation taking `(id, fields)`.
    ///
    /// `optimistic` merges the fields into every cached copy of the row first.
    pub fn update<T: Transport>(&self, transport: &T, optimistic: bool) -> MutationDescriptor<(Value, Value)> {
        let transport = transport.clone();
        let resource = self.clone();
        let matcher = self.matcher();

        let descriptor = MutationDescriptor::new(move |(id, fields): (Value, Value)| {
            let transport = transport.clone();
            let request = Request::put(resource.update_path(&id), fields);
            async move { transport.request(request).await.map(unwrap_envelope) }
        })
        .affects(matcher.clone());

        if !optimistic {
            return descriptor;
        }
        descriptor.optimistic(move |store, (id, fields): &(Value, Value)| {
            store.patch_matching(&matcher, |list| patches::replace_item(list, id, fields.clone()))
        })
    }

    /// Delete mutation taking the row id.
    ///
    /// `optimistic` removes the row from every cached view first.
    pub fn delete<T: Transport>(&self, transport: &T, optimistic: bool) -> MutationDescriptor<Value> {
        let transport = transport.clone();
        let resource = self.clone();
        let matcher = self.matcher();

        let descriptor = MutationDescriptor::new(move |id: Value| {
            let transport = transport.clone();
            let request = Request::delete(resource.delete_path(&id));
            async move { transport.request(request).await.map(unwrap_envelope) }
        })
        .affects(matcher.clone());

        if !optimistic {
            return descriptor;
        }
        descriptor.optimistic(move |store, id: &Value| {
            store.patch_matching(&matcher, |list| patches::remove_item(list, id))
        })
    }
}

/// One page of a paginated list answer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub content: Vec<Value>,
    pub total_pages: u32,
    pub total_elements: u64,
}

impl Page {
    /// Parse `{content, totalPages, totalElements}`. A bare array is read as a
    /// single page holding every row.
    pub fn from_value(value: &Value) -> Result<Page> {
        if let Value::Array(rows) = value {
            return Ok(Page {
                content: rows.clone(),
                total_pages: u32::from(!rows.is_empty()),
                total_elements: rows.len() as u64,
            });
        }

        let content = value
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Deserialization("page without content array".to_string()))?;
        let total_elements = value
            .get("totalElements")
            .and_then(Value::as_u64)
            .unwrap_or(content.len() as u64);
        let total_pages = value
            .get("totalPages")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(Page {
            content: content.clone(),
            total_pages: u32::try_from(total_pages)
                .map_err(|_| Error::Deserialization(format!("totalPages out of range: {}", total_pages)))?,
            total_elements,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

fn id_segment(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A new row carrying a temporary id, ready for an optimistic create.
pub fn draft(row: Value) -> Value {
    with_temp_id(&row)
}

fn with_temp_id(row: &Value) -> Value {
    let mut row = row.clone();
    if let Value::Object(fields) = &mut row {
        fields
            .entry("id")
            .or_insert_with(|| Value::String(patches::temp_id()));
    }
    row
}

/// Whether a newly created row belongs at the top of the cached view `key`.
fn shows_new_row(key: &CacheKey, row: &Value) -> bool {
    key.params().iter().all(|(name, value)| match name.as_str() {
        "page" => value.as_i64() == Some(1),
        "size" => true,
        "search" => value
            .as_str()
            .is_some_and(|needle| mentions(row, &needle.to_lowercase())),
        _ => row.get(name).is_some_and(|field| {
            ParamValue::from_json(field).as_ref() == Some(value)
                || field.as_str() == Some(value.to_string().as_str())
        }),
    })
}

fn mentions(row: &Value, needle: &str) -> bool {
    row.as_object().is_some_and(|fields| {
        fields
            .values()
            .filter_map(Value::as_str)
            .any(|text| text.to_lowercase().contains(needle))
    })
}

fn without_temp_id(mut row: Value) -> Value {
    if let Value::Object(fields) = &mut row {
        if fields.get("id").is_some_and(patches::is_temp_id) {
            fields.remove("id");
        }
    }
    row
}
