//! Crate-wide error taxonomy for the tracker core.
//!
//! A flat enum with `#[from]` conversions at the boundaries, plus a
//! retryability classification used by retry loops.

use std::sync::Arc;

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("permanent API error: HTTP {status}")]
    PermanentApi { status: u16 },

    #[error("authorization expired")]
    AuthExpired,

    #[error("unknown quality {expected:?}, available: {observed:?}")]
    UnknownQuality {
        expected: String,
        observed: Vec<String>,
    },

    #[error("live playlist window slipped: {from} -> {to}")]
    SegmentGap { from: u64, to: u64 },

    #[error("webhook signature mismatch")]
    SignatureMismatch,

    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("i/o error: {0}")]
    Io(String),

    #[error("network error: {0}")]
    Network(Arc<reqwest::Error>),

    #[error("json error: {0}")]
    Json(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl Error {
    /// Classifies whether a caller-side retry loop should retry this error:
    /// transient network errors, rate limiting and 5xx-shaped permanent API
    /// errors are retryable; everything else (bad config, signature
    /// mismatch, unknown quality, cancellation) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientNetwork(_) | Error::RateLimited { .. } => true,
            Error::PermanentApi { status } => *status >= 500,
            Error::Network(e) => e.is_connect() || e.is_timeout() || e.is_body() || e.is_decode(),
            _ => false,
        }
    }

    pub fn config_missing(name: &str) -> Self {
        Error::ConfigError {
            reason: format!("missing required setting `{name}`"),
        }
    }

    pub fn unknown_quality(expected: impl Into<String>, observed: Vec<String>) -> Self {
        Error::UnknownQuality {
            expected: expected.into(),
            observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_api_5xx_is_retryable_but_4xx_is_not() {
        assert!(Error::PermanentApi { status: 503 }.is_retryable());
        assert!(!Error::PermanentApi { status: 404 }.is_retryable());
    }

    #[test]
    fn config_and_signature_errors_are_never_retryable() {
        assert!(!Error::ConfigError { reason: "x".into() }.is_retryable());
        assert!(!Error::SignatureMismatch.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
