//! Cache key management.
//!
//! A [`CacheKey`] is an entity kind (`"regions"`, `"annDiscounts"`) plus the
//! effective query parameters of one view of it. Parameters live in a
//! `BTreeMap`, so two keys built with the same values in a different order are
//! equal and hash identically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scalar value of a key parameter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ParamValue {
    /// `false` for the "no filter" sentinels: `0` and the empty string.
    pub fn is_active(&self) -> bool {
        match self {
            ParamValue::Int(0) => false,
            ParamValue::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON scalar. Floats, arrays, objects and null have no key form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(ParamValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(ParamValue::Int),
            serde_json::Value::String(s) => Some(ParamValue::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Int(n) => serde_json::Value::from(*n),
            ParamValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(n) => write!(f, "{}", n),
            ParamValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Ordered parameter map folded into a [`CacheKey`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryParams(BTreeMap<String, ParamValue>);

impl QueryParams {
    pub fn new() -> Self {
        QueryParams(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.0.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Copy without the "no filter" sentinels.
    pub fn active(&self) -> QueryParams {
        QueryParams(
            self.0
                .iter()
                .filter(|(_, v)| v.is_active())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// True when every parameter of `self` is present in `other` with the same value.
    pub fn is_subset_of(&self, other: &QueryParams) -> bool {
        self.0.iter().all(|(k, v)| other.0.get(k) == Some(v))
    }

    /// Active parameters as `(name, value)` string pairs for a query string.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .filter(|(_, v)| v.is_active())
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        QueryParams(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Structured cache key: entity prefix plus ordered parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    prefix: String,
    params: QueryParams,
}

impl CacheKey {
    /// Key for the unparameterised dataset of an entity kind.
    pub fn new(prefix: impl Into<String>) -> Self {
        CacheKey {
            prefix: prefix.into(),
            params: QueryParams::new(),
        }
    }

    /// Key with parameters. "No filter" sentinels are dropped so that
    /// `{type: 0}` and `{}` address the same entry.
    pub fn with_params(prefix: impl Into<String>, params: QueryParams) -> Self {
        CacheKey {
            prefix: prefix.into(),
            params: params.active(),
        }
    }

    /// Builder-style parameter insert. Inactive values are ignored.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let value = value.into();
        if value.is_active() {
            self.params.insert(name, value);
        }
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// Matcher selecting exactly this key's prefix.
    pub fn matcher(&self) -> KeyMatcher {
        KeyMatcher::prefix(self.prefix.clone())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

impl From<&str> for CacheKey {
    fn from(prefix: &str) -> Self {
        CacheKey::new(prefix)
    }
}

/// Selects the cache keys an invalidation or prefix-wide patch applies to.
///
/// A matcher with no parameters selects every key of its prefix. Parameters
/// narrow it to keys that carry all of them with equal values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyMatcher {
    prefix: String,
    params: QueryParams,
}

impl KeyMatcher {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyMatcher {
            prefix: prefix.into(),
            params: QueryParams::new(),
        }
    }

    /// Narrow the matcher to keys carrying `name = value`.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name, value);
        self
    }

    pub fn prefix_str(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        key.prefix == self.prefix && self.params.is_subset_of(&key.params)
    }
}

impl fmt::Display for KeyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix)?;
        for (name, value) in self.params.iter() {
            write!(f, "[{}={}]", name, value)?;
        }
        Ok(())
    }
}

impl From<&str> for KeyMatcher {
    fn from(prefix: &str) -> Self {
        KeyMatcher::prefix(prefix)
    }
}

impl From<String> for KeyMatcher {
    fn from(prefix: String) -> Self {
        KeyMatcher::prefix(prefix)
    }
}

impl From<&CacheKey> for KeyMatcher {
    fn from(key: &CacheKey) -> Self {
        KeyMatcher {
            prefix: key.prefix.clone(),
            params: key.params.clone(),
        }
    }
}
