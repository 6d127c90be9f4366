//! Translation: LLM backend, translator, and the priority queue
//!
//! The queue schedules requests against the translator under a global
//! concurrency cap with per-item timeouts and retries; the translator
//! invokes the LLM provider in streaming or non-streaming mode depending on
//! the quality tier.

mod backend;
mod queue;
mod translator;

pub use backend::{BackendRequest, HttpBackend, ReasoningEffort, TranslationBackend};
pub use queue::{QueueEvent, QueueSettings, TranslationQueue};
pub use translator::Translator;

use thiserror::Error;

/// Translation errors
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("provider error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TranslateError {
    /// Rate-limit indications, transient server failures, and transport
    /// errors are retried with backoff; other provider rejections are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TranslateError::Network(_) | TranslateError::Timeout => true,
            TranslateError::Api { status, .. } => {
                matches!(status, 408 | 429) || (500..=599).contains(status)
            }
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TranslateError::Api { status: 429, .. })
    }
}

impl From<reqwest::Error> for TranslateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TranslateError::Timeout
        } else {
            TranslateError::Network(err.to_string())
        }
    }
}

impl From<TranslateError> for lectern_core::Error {
    fn from(err: TranslateError) -> Self {
        lectern_core::Error::Translation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(TranslateError::Network("reset".into()).is_retryable());
        assert!(TranslateError::Timeout.is_retryable());
        assert!(TranslateError::Api { status: 429, message: String::new() }.is_retryable());
        assert!(TranslateError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(TranslateError::Api { status: 408, message: String::new() }.is_retryable());
        assert!(!TranslateError::Api { status: 400, message: String::new() }.is_retryable());
        assert!(!TranslateError::Api { status: 404, message: String::new() }.is_retryable());
        assert!(!TranslateError::InvalidResponse("x".into()).is_retryable());
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(TranslateError::Api { status: 429, message: String::new() }.is_rate_limited());
        assert!(!TranslateError::Api { status: 500, message: String::new() }.is_rate_limited());
    }
}
