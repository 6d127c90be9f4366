//! Configuration for the lecture translation pipeline
//!
//! All thresholds are optional in the file; defaults match the documented
//! component behavior. Environment variables override files
//! (`LECTERN_ASR__API_KEY`, `LECTERN_QUEUE__MAX_CONCURRENCY`, ...).

mod settings;

pub use settings::{
    AsrConfig, AudioConfig, CoalescerConfig, DisplayConfig, ParagraphConfig, PipelineConfig,
    QueueConfig, SentenceConfig, Settings, TranslatorConfig,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for lectern_core::Error {
    fn from(err: ConfigError) -> Self {
        lectern_core::Error::Configuration(err.to_string())
    }
}
