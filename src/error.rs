//! Error types for the query engine.

use std::fmt;

/// Result type for query and mutation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the query engine.
///
/// Query failures are stored on the cache entry and handed to every
/// subscriber, so the type is `Clone`. Mutation failures are returned to the
/// caller of `mutate`/`run`.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The transport could not reach the backend.
    ///
    /// Common causes:
    /// - Connection refused or DNS failure
    /// - Transport-level timeout
    /// - Request aborted by the transport
    ///
    /// **Recovery:** `refetch()` once connectivity is back.
    Network(String),

    /// The backend rejected the request (HTTP 4xx).
    ///
    /// Validation failures and not-found responses land here. `message`
    /// carries the server's `message` field when it sent one.
    Client {
        /// HTTP status code
        status: u16,
        /// Server-provided message, if any
        message: Option<String>,
    },

    /// The backend failed while handling the request (HTTP 5xx).
    Server {
        /// HTTP status code
        status: u16,
        /// Server-provided message, if any
        message: Option<String>,
    },

    /// A shared in-flight fetch failed.
    ///
    /// Returned to callers that attached to a fetch started by someone else.
    /// Every waiter receives the same underlying error.
    Deduped(Box<Error>),

    /// Invalid input to the engine (page 0, size 0, malformed id, ...).
    Validation(String),

    /// The payload did not have the shape the caller expected.
    Deserialization(String),

    /// Invalid client or store configuration.
    Config(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Classify an HTTP status and optional server message.
    ///
    /// Statuses below 400 are not errors; they map to `Other` so that a
    /// transport bug never passes silently.
    pub fn from_status(status: u16, message: Option<String>) -> Self {
        match status {
            400..=499 => Error::Client { status, message },
            500..=599 => Error::Server { status, message },
            _ => Error::Other(format!(
                "unexpected status {}{}",
                status,
                message.map(|m| format!(": {}", m)).unwrap_or_default()
            )),
        }
    }

    /// Wrap an error handed to a caller that joined another caller's fetch.
    pub fn deduped(self) -> Self {
        match self {
            Error::Deduped(_) => self,
            other => Error::Deduped(Box::new(other)),
        }
    }

    /// The innermost error, looking through `Deduped`.
    pub fn root(&self) -> &Error {
        match self {
            Error::Deduped(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether repeating the request could plausibly succeed.
    ///
    /// Informational only: the engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), Error::Network(_) | Error::Server { .. })
    }

    /// HTTP status for `Client`/`Server` errors.
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            Error::Client { status, .. } | Error::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Network(msg) => write!(f, "Network error: {}", msg),
            Error::Client { status, message } => match message {
                Some(msg) => write!(f, "Client error ({}): {}", status, msg),
                None => write!(f, "Client error ({})", status),
            },
            Error::Server { status, message } => match message {
                Some(msg) => write!(f, "Server error ({}): {}", status, msg),
                None => write!(f, "Server error ({})", status),
            },
            Error::Deduped(inner) => write!(f, "Shared fetch failed: {}", inner),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Deserialization(msg) => write!(f, "Deserialization error: {}", msg),
            Error::Config(msg) => write!(f, "Config error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Deduped(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::Network(e.to_string())
        } else {
            Error::Deserialization(e.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}
