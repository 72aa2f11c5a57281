//! Error types for the timer store.
//!
//! All errors are explicit and typed. Conditional-operation outcomes
//! (absent keys, CAS mismatches) are never errors; they are returned as
//! flags from the KV facade and callers branch on them.

use thiserror::Error;

/// Errors that can occur during timer store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing KV rejected or failed an operation
    #[error("kv operation failed: {reason}")]
    Kv { reason: String },

    /// A KV operation kept failing transiently until the retry budget ran out
    #[error("kv retries exhausted: {op} on '{key}'")]
    RetryTimeout { op: &'static str, key: String },

    /// Encoding or decoding a stored record failed
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// No KV client is registered for the connection string
    #[error("no kv backend registered for '{connstr}'")]
    UnknownBackend { connstr: String },
}

impl StoreError {
    /// Create a KV failure error.
    pub fn kv(reason: impl Into<String>) -> Self {
        Self::Kv {
            reason: reason.into(),
        }
    }

    /// Create a retry-exhaustion error.
    pub fn retry_timeout(op: &'static str, key: impl Into<String>) -> Self {
        Self::RetryTimeout {
            op,
            key: key.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Create an unknown-backend error.
    pub fn unknown_backend(connstr: impl Into<String>) -> Self {
        Self::UnknownBackend {
            connstr: connstr.into(),
        }
    }

    /// Check if the error is worth retrying at the KV facade.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Kv { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for timer store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_error_is_retryable() {
        assert!(StoreError::kv("socket closed").is_retryable());
        assert!(!StoreError::retry_timeout("get", "k").is_retryable());
        assert!(!StoreError::serialization("bad json").is_retryable());
        assert!(!StoreError::unknown_backend("couchbase://x").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::retry_timeout("upsert", "p:timerstore:h:0:span");
        assert_eq!(
            err.to_string(),
            "kv retries exhausted: upsert on 'p:timerstore:h:0:span'"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let parse = serde_json::from_str::<i64>("not a number");
        let err: StoreError = match parse {
            Err(e) => e.into(),
            Ok(_) => unreachable!("parse must fail"),
        };
        assert!(matches!(err, StoreError::Serialization { .. }));
    }
}
