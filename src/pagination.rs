//! Pagination and filter state folded into cache keys.
//!
//! Every list view owns one coordinator. Changing a filter or the page size
//! resets to the first page, since the old page number may not exist under the
//! new constraints. Inactive filters (`0`, `""`) are left out of keys, so a view
//! with `{type: 0}` shares its cache entry with a view without filters.

use crate::error::{Error, Result};
use crate::key::{CacheKey, ParamValue, QueryParams};
use std::collections::BTreeMap;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaginationFilter {
    page: u32,
    size: u32,
    filters: BTreeMap<String, ParamValue>,
}

impl PaginationFilter {
    pub fn new<K, V>(page: u32, size: u32, filters: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<ParamValue>,
    {
        validate("page", page)?;
        validate("size", size)?;
        Ok(PaginationFilter {
            page,
            size,
            filters: filters
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// All filters as set, including inactive ones.
    pub fn filters(&self) -> &BTreeMap<String, ParamValue> {
        &self.filters
    }

    pub fn filter(&self, field: &str) -> Option<&ParamValue> {
        self.filters.get(field)
    }

    pub fn set_page(&mut self, page: u32) -> Result<()> {
        validate("page", page)?;
        self.page = page;
        Ok(())
    }

    /// Change the page size and go back to the first page.
    pub fn set_size(&mut self, size: u32) -> Result<()> {
        validate("size", size)?;
        self.size = size;
        self.page = DEFAULT_PAGE;
        Ok(())
    }

    /// Replace every filter and go back to the first page.
    pub fn set_filters<K, V>(&mut self, filters: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<ParamValue>,
    {
        self.filters = filters
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.page = DEFAULT_PAGE;
    }

    /// Set one filter and go back to the first page.
    pub fn set_filter(&mut self, field: impl Into<String>, value: impl Into<ParamValue>) {
        self.filters.insert(field.into(), value.into());
        self.page = DEFAULT_PAGE;
    }

    pub fn clear_filters(&mut self) {
        self.filters.clear();
        self.page = DEFAULT_PAGE;
    }

    /// Advance one page unless already on the last. Returns whether it moved.
    pub fn next_page(&mut self, total_pages: u32) -> bool {
        if self.page < total_pages {
            self.page += 1;
            true
        } else {
            false
        }
    }

    /// Go back one page, stopping at the first. Returns whether it moved.
    pub fn prev_page(&mut self) -> bool {
        if self.page > DEFAULT_PAGE {
            self.page -= 1;
            true
        } else {
            false
        }
    }

    /// `{page, size}` plus every active filter.
    pub fn params(&self) -> QueryParams {
        let mut params: QueryParams = self
            .filters
            .iter()
            .filter(|(_, v)| v.is_active())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.insert("page", self.page);
        params.insert("size", self.size);
        params
    }

    pub fn key(&self, prefix: impl Into<String>) -> CacheKey {
        CacheKey::with_params(prefix, self.params())
    }
}

impl Default for PaginationFilter {
    fn default() -> Self {
        PaginationFilter {
            page: DEFAULT_PAGE,
            size: DEFAULT_PAGE_SIZE,
            filters: BTreeMap::new(),
        }
    }
}

fn validate(field: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(Error::Validation(format!("{} must be at least 1", field)));
    }
    Ok(())
}
