//! Error types shared across the pipeline crates
//!
//! Two layers:
//! - [`Error`] is the crate-boundary error returned by the narrow capability
//!   traits (recognizer, translator). Components convert their internal
//!   errors into it before crossing a seam.
//! - [`ErrorCode`] is the event-facing taxonomy carried on `error` events.
//!   The code set is closed; new failure classes get a new variant, not a
//!   free-form string.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shared result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Cross-crate error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("recognizer error: {0}")]
    Recognizer(String),

    #[error("model {model} does not support language {language}")]
    UnsupportedLanguage { model: String, language: String },

    #[error("translation error: {0}")]
    Translation(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Event-facing error codes, serialized SCREAMING_SNAKE_CASE on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SchemaViolation,
    AudioBackpressureDrop,
    AsrBadRequest,
    AsrUnauthorized,
    AsrUnsupportedLanguage,
    AsrConnectionLost,
    AsrReconnectionFailed,
    TranslationTimeout,
    TranslationRateLimited,
    TranslationFailed,
    EventBusOverflow,
    InvalidStateTransition,
    Internal,
}

impl ErrorCode {
    /// Whether errors of this code are recoverable by default. Individual
    /// events may override via [`ErrorPayload::recoverable`].
    pub fn default_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorCode::AsrBadRequest
                | ErrorCode::AsrUnauthorized
                | ErrorCode::AsrUnsupportedLanguage
                | ErrorCode::AsrReconnectionFailed
        )
    }
}

/// Payload of an `error` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    /// Set when the error drove the pipeline into the `error` state
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fatal: bool,
    /// Free-form context, e.g. `{"request_id": "..."}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: code.default_recoverable(),
            fatal: false,
            context: None,
        }
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self.recoverable = false;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}
