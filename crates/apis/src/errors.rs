//! Types for the errors that can occur across the fetch and cache layers.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Boxed source for errors wrapping backend-specific failures.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("upstream returned status {status}: {context}")]
    /// A 4xx/5xx response from an upstream API.
    Api {
        /// The HTTP status code.
        status: u16,
        /// The endpoint or operation that failed.
        context: String,
        /// Suggested wait before retrying, when the upstream provided one.
        retry_after: Option<std::time::Duration>,
    },

    #[error("all {keys_tried} API keys were rate limited in one pass (last status {status})")]
    /// Every configured key was rejected with 429/403 in a single pass.
    KeyRotation {
        /// The last status code observed.
        status: u16,
        /// How many keys were tried.
        keys_tried: usize,
    },

    #[error("quota gate refused {requested} units ({used}/{limit} used, resets at {reset_time})")]
    /// The secondary source's quota gate refused the call before it was issued.
    QuotaExceeded {
        used: u32,
        limit: u32,
        requested: u32,
        reset_time: DateTime<Utc>,
    },

    #[error("schedule page layout changed: {parsed} cards parsed, {} errors", .parse_errors.len())]
    /// The scraper found no streams or an excessive parse-error rate.
    StructureChanged {
        /// How many cards parsed successfully.
        parsed: usize,
        /// The individual card parse failures.
        parse_errors: Vec<String>,
    },

    #[error("cache {operation} failed for key {key}")]
    /// A KV store operation failed; treated as transient by callers.
    Cache {
        operation: &'static str,
        key: String,
        #[source]
        source: BoxedSource,
    },

    #[error("circuit open, retry after {next_retry}")]
    /// The circuit breaker refused the call.
    CircuitOpen {
        /// When the breaker next allows a probe.
        next_retry: DateTime<Utc>,
    },

    #[error("invalid {field}: {value}")]
    /// Rejected input from the chat layer or an API boundary.
    Validation { field: &'static str, value: String },

    #[error("{service} returned malformed data during {operation}")]
    /// An upstream replied, but with data this system cannot use.
    Service {
        service: &'static str,
        operation: &'static str,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("request to {context} failed")]
    /// A transport-level failure before any status code was received.
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("durable store operation {operation} failed")]
    /// A relational-store failure.
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl Error {
    /// Whether the schedule service should substitute the scraper for
    /// this failure: breaker refusals, key exhaustion, and server-side
    /// errors qualify; client-side errors do not.
    #[must_use]
    pub fn warrants_fallback(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } | Self::KeyRotation { .. } | Self::Http { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::QuotaExceeded { .. }
            | Self::StructureChanged { .. }
            | Self::Cache { .. }
            | Self::Validation { .. }
            | Self::Service { .. }
            | Self::Database { .. } => false,
        }
    }

    /// Whether the failure counts as a rate limit for breaker purposes.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::KeyRotation { .. } => true,
            Self::Api { status, .. } => *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_decision_covers_the_server_side_classes() {
        let server = Error::Api {
            status: 503,
            context: "live".into(),
            retry_after: None,
        };
        assert!(server.warrants_fallback());

        let client = Error::Api {
            status: 404,
            context: "channels".into(),
            retry_after: None,
        };
        assert!(!client.warrants_fallback());

        let rotation = Error::KeyRotation {
            status: 429,
            keys_tried: 3,
        };
        assert!(rotation.warrants_fallback());
        assert!(rotation.is_rate_limit());

        let open = Error::CircuitOpen {
            next_retry: Utc::now(),
        };
        assert!(open.warrants_fallback());
        assert!(!open.is_rate_limit());
    }
}
