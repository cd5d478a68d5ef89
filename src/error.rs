//! Core error types.
//!
//! One taxonomy for the whole pipeline. The dispatcher's retry policy only
//! cares about `is_retryable()`: transient infrastructure failures and
//! rate-limit denials are retried with backoff, everything else either
//! surfaces to the caller or lands the job in the dead-letter queue.

use thiserror::Error;

use crate::session::SessionState;

/// Errors that can occur during core pipeline operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Shared store, queue, database, or upstream HTTP failure. Retryable.
    #[error("infrastructure error: {reason}")]
    Infra { reason: String },

    /// LLM or embedding backend failure after client-side retries. Retryable.
    #[error("model backend error: {reason}")]
    Model { reason: String },

    /// Outbound gate closed by the rate limiter. Retryable.
    #[error("rate limited: retry in {reset_in_ms}ms")]
    RateLimited { reset_in_ms: u64 },

    /// Illegal session state-machine move. Never retried.
    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Concurrent session write detected via the version field. The worker
    /// retries the job against the fresh blob.
    #[error("session version conflict for '{customer_id}': stored {stored}, ours {ours}")]
    VersionConflict {
        customer_id: String,
        stored: u64,
        ours: u64,
    },

    /// Input or model output failed validation. Locally recovered where
    /// possible (drop field, fall back), surfaced otherwise.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// Missing session, conversation, or agent row.
    #[error("{what} not found: '{id}'")]
    NotFound { what: String, id: String },

    /// JSON (de)serialization failure.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Bug-shaped error. Goes straight to the DLQ.
    #[error("permanent error: {reason}")]
    Permanent { reason: String },
}

impl CoreError {
    /// Whether the dispatcher should retry the job after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Infra { .. }
                | CoreError::Model { .. }
                | CoreError::RateLimited { .. }
                | CoreError::VersionConflict { .. }
        )
    }

    /// Shorthand for an infrastructure error.
    pub fn infra(reason: impl Into<String>) -> Self {
        CoreError::Infra {
            reason: reason.into(),
        }
    }

    /// Shorthand for a not-found error.
    pub fn not_found(what: impl Into<String>, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            what: what.into(),
            id: id.into(),
        }
    }
}

/// Convenience alias used across the crate.
pub type CoreResult<T> = Result<T, CoreError>;

impl From<redis::RedisError> for CoreError {
    fn from(e: redis::RedisError) -> Self {
        CoreError::Infra {
            reason: format!("redis: {e}"),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Infra {
            reason: format!("sqlite: {e}"),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Infra {
            reason: format!("http: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::infra("store down").is_retryable());
        assert!(CoreError::Model {
            reason: "503".into()
        }
        .is_retryable());
        assert!(CoreError::RateLimited { reset_in_ms: 500 }.is_retryable());
        assert!(CoreError::VersionConflict {
            customer_id: "+20100".into(),
            stored: 2,
            ours: 1
        }
        .is_retryable());

        assert!(!CoreError::InvalidTransition {
            from: SessionState::Closed,
            to: SessionState::Active
        }
        .is_retryable());
        assert!(!CoreError::Validation {
            reason: "bad budget".into()
        }
        .is_retryable());
        assert!(!CoreError::not_found("session", "s1").is_retryable());
        assert!(!CoreError::Permanent {
            reason: "bug".into()
        }
        .is_retryable());
    }
}
