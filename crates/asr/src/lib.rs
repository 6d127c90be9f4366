//! Streaming recognizer session
//!
//! Manages exactly one WebSocket session to the speech recognizer: audio
//! forwarding, fragment extraction, keep-alive against the provider's idle
//! timeout, and automatic reconnection with exponential backoff.

mod protocol;
mod session;

pub use protocol::{
    classify_close, listen_url, resolve_language, CloseClass, ServerMessage,
    CLOSE_STREAM_MESSAGE, KEEPALIVE_MESSAGE,
};
pub use session::{AsrSession, SessionConfig};

use thiserror::Error;

/// Recognizer session errors
#[derive(Error, Debug)]
pub enum AsrError {
    #[error("model {model} does not support language {language}")]
    UnsupportedLanguage { model: String, language: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),
}

impl From<AsrError> for lectern_core::Error {
    fn from(err: AsrError) -> Self {
        match err {
            AsrError::UnsupportedLanguage { model, language } => {
                lectern_core::Error::UnsupportedLanguage { model, language }
            }
            other => lectern_core::Error::Recognizer(other.to_string()),
        }
    }
}
