//! Transport capability consumed by fetch and mutation functions.
//!
//! The engine never talks HTTP itself. Fetch and perform functions call a
//! [`Transport`], which owns header injection, auth, TLS and timeouts. The
//! engine never retries a request.

use crate::error::Result;
use crate::key::QueryParams;
use serde_json::Value;
use std::fmt;
use std::future::Future;

#[cfg(feature = "inmemory")]
pub mod inmemory;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// One request to the remote backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Request {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Append the active parameters as query pairs.
    pub fn params(mut self, params: &QueryParams) -> Self {
        self.query.extend(params.to_query_pairs());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        for (i, (name, value)) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

/// Trait for the remote backend the console talks to.
///
/// **IMPORTANT:** `request` takes `&self`; implementations are shared between
/// concurrent fetches and must use interior mutability.
///
/// Failures are reported as `Error::Network` (unreachable, timed out) or
/// `Error::from_status` for an HTTP error status.
pub trait Transport: Send + Sync + Clone + 'static {
    /// Send one request and return the decoded JSON body.
    ///
    /// # Errors
    /// Returns `Err` on network failure or a non-success status.
    fn request(&self, request: Request) -> impl Future<Output = Result<Value>> + Send;
}
