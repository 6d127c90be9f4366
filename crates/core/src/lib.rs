//! Core types and traits for the live lecture translation pipeline
//!
//! This crate provides the foundational types used across all other crates:
//! - Audio frame types
//! - Transcript units (fragment, sentence, paragraph)
//! - Translation request/result types and queue statistics
//! - Display segment/snapshot types
//! - The versioned event envelope, event union, and v1 schema
//! - The command surface and pipeline lifecycle state
//! - Error taxonomy
//! - Narrow capability traits at component seams

pub mod audio;
pub mod commands;
pub mod display;
pub mod error;
pub mod events;
pub mod language;
pub mod schema;
pub mod similarity;
pub mod state;
pub mod traits;
pub mod transcript;
pub mod translation;

pub use audio::{frame_bytes, AudioFrame, DEFAULT_FRAME_MS, DEFAULT_SAMPLE_RATE};
pub use commands::{Command, CommandResponse, StartCommand, TranslateUserText};
pub use display::{DisplaySegment, DisplaySnapshot, Slot};
pub use error::{Error, ErrorCode, ErrorPayload, Result};
pub use events::{
    now_ms, EventEnvelope, EventKind, FinalReportPayload, PipelineEvent, StatsPayload,
    StatusPayload, SummaryPayload, VocabularyPayload, VocabularyTerm, EVENT_SCHEMA_VERSION,
};
pub use language::Language;
pub use schema::validate_event;
pub use state::PipelineState;
pub use traits::{RecognizerEvent, RecognizerStats, SpeechRecognizer};
pub use transcript::{ends_sentence, Paragraph, Sentence, TranscriptFragment};
pub use translation::{
    Priority, QualityTier, QueuePriorityStats, QueueStats, TranslationDelta, TranslationRequest,
    TranslationResult,
};
