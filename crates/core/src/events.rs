//! Versioned event envelope and the tagged event union
//!
//! Every pipeline output crosses the bus as an [`EventEnvelope`]: schema
//! version, unique id, per-session monotonic sequence number, wall-clock
//! timestamp, optional correlation id, and a `kind`-tagged payload. Events
//! are immutable once emitted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::display::DisplaySnapshot;
use crate::error::ErrorPayload;
use crate::language::Language;
use crate::state::PipelineState;
use crate::traits::RecognizerStats;
use crate::transcript::{Paragraph, Sentence, TranscriptFragment};
use crate::translation::{QueueStats, TranslationDelta, TranslationResult};

/// Bus schema version. Producers never mix versions within a session;
/// subscribers reject anything else.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Wall-clock milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Event kinds, used for per-kind ordering and subscription filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Fragment,
    Sentence,
    Paragraph,
    TranslationDelta,
    TranslationComplete,
    DisplayUpdate,
    Summary,
    Vocabulary,
    FinalReport,
    Status,
    Error,
    Stats,
}

/// The tagged union of pipeline outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum PipelineEvent {
    Fragment(TranscriptFragment),
    Sentence(Sentence),
    Paragraph(Paragraph),
    TranslationDelta(TranslationDelta),
    TranslationComplete(TranslationResult),
    DisplayUpdate(DisplaySnapshot),
    Summary(SummaryPayload),
    Vocabulary(VocabularyPayload),
    FinalReport(FinalReportPayload),
    Status(StatusPayload),
    Error(ErrorPayload),
    Stats(StatsPayload),
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::Fragment(_) => EventKind::Fragment,
            PipelineEvent::Sentence(_) => EventKind::Sentence,
            PipelineEvent::Paragraph(_) => EventKind::Paragraph,
            PipelineEvent::TranslationDelta(_) => EventKind::TranslationDelta,
            PipelineEvent::TranslationComplete(_) => EventKind::TranslationComplete,
            PipelineEvent::DisplayUpdate(_) => EventKind::DisplayUpdate,
            PipelineEvent::Summary(_) => EventKind::Summary,
            PipelineEvent::Vocabulary(_) => EventKind::Vocabulary,
            PipelineEvent::FinalReport(_) => EventKind::FinalReport,
            PipelineEvent::Status(_) => EventKind::Status,
            PipelineEvent::Error(_) => EventKind::Error,
            PipelineEvent::Stats(_) => EventKind::Stats,
        }
    }
}

/// The envelope delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u32,
    pub id: String,
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

impl EventEnvelope {
    pub fn new(seq: u64, correlation_id: Option<String>, event: PipelineEvent) -> Self {
        Self {
            version: EVENT_SCHEMA_VERSION,
            id: Uuid::new_v4().to_string(),
            seq,
            ts_ms: now_ms(),
            correlation_id,
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

/// Status events: lifecycle transitions, recognizer connection changes,
/// and the utterance-end hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusPayload {
    State {
        state: PipelineState,
    },
    UtteranceEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_word_end_ms: Option<u64>,
    },
    Connection {
        connected: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// Progressive summary payload, language-tagged (never language-named)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub text: String,
    pub source_language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<Language>,
    /// Stream offset this summary covers, milliseconds
    pub covered_until_ms: u64,
}

/// One domain-vocabulary entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyTerm {
    pub term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
}

/// Domain-vocabulary payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyPayload {
    pub terms: Vec<VocabularyTerm>,
    pub source_language: Language,
}

/// Final session report skeleton, emitted by the orchestrator on stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReportPayload {
    pub session_id: String,
    pub duration_ms: u64,
    pub sentence_count: u64,
    pub paragraph_count: u64,
    pub word_count: u64,
    pub source_language: Language,
    pub target_language: Language,
}

/// Periodic pipeline statistics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsPayload {
    pub asr: RecognizerStats,
    pub queue: QueueStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ErrorPayload};

    #[test]
    fn test_envelope_round_trip() {
        let envelope = EventEnvelope::new(
            7,
            Some("corr-1".into()),
            PipelineEvent::Status(StatusPayload::State {
                state: PipelineState::Listening,
            }),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_kind_tagging() {
        let envelope = EventEnvelope::new(
            0,
            None,
            PipelineEvent::Error(ErrorPayload::new(ErrorCode::Internal, "x")),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["kind"], "error");
        assert_eq!(value["version"], 1);
        assert_eq!(value["payload"]["code"], "INTERNAL");
        assert_eq!(envelope.kind(), EventKind::Error);
    }

    #[test]
    fn test_fragment_event_shape() {
        let fragment = TranscriptFragment::new("hello", 0.8, false, 0, 300, Language::new("en"));
        let envelope = EventEnvelope::new(1, None, PipelineEvent::Fragment(fragment));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["kind"], "fragment");
        assert_eq!(value["payload"]["text"], "hello");
        assert_eq!(value["payload"]["is_final"], false);
    }

    #[test]
    fn test_now_ms_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after 2020
    }
}
