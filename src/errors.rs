use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::DatabaseError;

/// Retry metadata surfaced on upstream errors when retries were attempted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryMetadata {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Structured validation/build error returned by the crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "{}: {}", field, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<String> for ValidationError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ValidationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Error envelope returned by the model endpoint for non-retryable statuses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct APIError {
    pub status: u16,
    /// Machine-readable error code (`code` in the envelope).
    pub code: Option<String>,
    /// Error category (`type` in the envelope).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryMetadata>,
    /// Raw response body for debugging (when available).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl APIError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            kind: None,
            message: message.into(),
            request_id: None,
            retries: None,
            raw_body: None,
        }
    }
}

impl fmt::Display for APIError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "{} ({}): {}", code, self.status, self.message)
        } else {
            write!(f, "{}: {}", self.status, self.message)
        }
    }
}

impl std::error::Error for APIError {}

/// Convenience alias for fallible results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transport-level error (timeouts, DNS/TLS/connectivity).
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub source: Option<reqwest::Error>,
}

impl TransportError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_request() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Broad transport error kinds for classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Request => "request",
            TransportErrorKind::Other => "transport",
        };
        write!(f, "{label}")
    }
}

/// Unified error type surfaced by the crate.
///
/// Errors raised while executing a tool (`Database`, `UnknownTable`) never reach
/// the caller of [`crate::SqlAgent::answer_question`]; the loop folds them into
/// the conversation. The loop-terminating variants are produced by
/// [`crate::LoopOutcome::into_result`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Api(#[from] APIError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Database(#[from] DatabaseError),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("unknown table '{table}'")]
    UnknownTable { table: String, available: Vec<String> },

    #[error("language model unavailable: {message}")]
    UpstreamUnavailable {
        message: String,
        retries: Option<RetryMetadata>,
    },

    #[error("language model rate limited: {message}")]
    UpstreamRateLimited {
        message: String,
        retry_after: Option<Duration>,
        retries: Option<RetryMetadata>,
    },

    #[error("unparseable model output: {reason}")]
    Unparseable { reason: String },

    #[error("unknown tool '{tool}'. Available: {}", available.join(", "))]
    ProtocolViolation { tool: String, available: Vec<String> },

    #[error("turn limit of {max_turns} exceeded")]
    TurnLimitExceeded { max_turns: usize },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the loop may retry the model call that produced this error.
    pub fn is_upstream_retryable(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable { .. } | Error::UpstreamRateLimited { .. }
        )
    }

    /// Server-suggested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::UpstreamRateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn upstream_unavailable(message: impl Into<String>) -> Self {
        Error::UpstreamUnavailable {
            message: message.into(),
            retries: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_formats_with_field() {
        let err = ValidationError::new("is required").with_field("model");
        assert_eq!(err.to_string(), "model: is required");
    }

    #[test]
    fn api_error_keeps_status_and_body() {
        let api_err = APIError {
            status: 400,
            code: Some("context_length_exceeded".into()),
            kind: Some("invalid_request_error".into()),
            message: "too many tokens".into(),
            request_id: Some("req_123".into()),
            retries: None,
            raw_body: Some("{\"error\":{}}".into()),
        };

        assert_eq!(
            api_err.to_string(),
            "context_length_exceeded (400): too many tokens"
        );
        assert!(api_err.raw_body.is_some());
    }

    #[test]
    fn protocol_violation_lists_available_tools() {
        let err = Error::ProtocolViolation {
            tool: "drop_everything".into(),
            available: vec!["list_tables".into(), "run_query".into()],
        };
        assert_eq!(
            err.to_string(),
            "unknown tool 'drop_everything'. Available: list_tables, run_query"
        );
    }

    #[test]
    fn only_upstream_errors_are_retryable() {
        assert!(Error::upstream_unavailable("down").is_upstream_retryable());
        let limited = Error::UpstreamRateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
            retries: None,
        };
        assert!(limited.is_upstream_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
        assert!(!Error::Api(APIError::new(400, "bad")).is_upstream_retryable());
        assert!(!Error::Cancelled.is_upstream_retryable());
    }
}
