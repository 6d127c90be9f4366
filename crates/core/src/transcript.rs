//! Transcript units: fragments, sentences, paragraphs
//!
//! A fragment is one recognizer result (interim or final). Final fragments
//! combine into sentences; sentences group into paragraphs. The transcript
//! unit never embeds a translation: translation results reference units by
//! id and carry their own `source_*`/`target_*` fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::language::Language;

/// Sentence-terminating characters, Latin and CJK
pub const SENTENCE_TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// True when the trimmed text ends with a sentence terminator
pub fn ends_sentence(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .map(|c| SENTENCE_TERMINATORS.contains(&c))
        .unwrap_or(false)
}

/// One transcription result from the recognizer.
///
/// Once a fragment with a given `id` has been observed with
/// `is_final = true`, no further updates for that id exist. Interim
/// fragments may be superseded by newer interims covering the same span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFragment {
    pub id: String,
    pub text: String,
    /// Recognizer confidence, 0.0 when the provider omits it
    pub confidence: f32,
    pub is_final: bool,
    /// Offsets in the audio stream, milliseconds
    pub start_ms: u64,
    pub end_ms: u64,
    pub language: Language,
    pub received_at: DateTime<Utc>,
}

impl TranscriptFragment {
    pub fn new(
        text: impl Into<String>,
        confidence: f32,
        is_final: bool,
        start_ms: u64,
        end_ms: u64,
        language: Language,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            is_final,
            start_ms,
            end_ms,
            language,
            received_at: Utc::now(),
        }
    }
}

/// A sentence combined from consecutive final fragments.
///
/// `source_text` is the fragment texts, each trimmed, joined with single
/// spaces, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub id: String,
    pub fragment_ids: Vec<String>,
    pub source_text: String,
    pub source_language: Language,
    pub start_time: u64,
    pub end_time: u64,
    pub fragment_count: usize,
    pub avg_confidence: f32,
}

impl Sentence {
    /// Build a sentence from final fragments in arrival order. Returns
    /// `None` for an empty slice or when every fragment text is blank.
    pub fn from_fragments(fragments: &[TranscriptFragment]) -> Option<Self> {
        if fragments.is_empty() {
            return None;
        }

        let source_text = fragments
            .iter()
            .map(|f| f.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if source_text.is_empty() {
            return None;
        }

        let avg_confidence =
            fragments.iter().map(|f| f.confidence).sum::<f32>() / fragments.len() as f32;

        Some(Self {
            id: Uuid::new_v4().to_string(),
            fragment_ids: fragments.iter().map(|f| f.id.clone()).collect(),
            source_text,
            source_language: fragments[0].language.clone(),
            start_time: fragments.first().map(|f| f.start_ms).unwrap_or(0),
            end_time: fragments.last().map(|f| f.end_ms).unwrap_or(0),
            fragment_count: fragments.len(),
            avg_confidence,
        })
    }
}

/// A paragraph grouped from consecutive sentences. The unit for the
/// low-priority high-quality retranslation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    pub id: String,
    pub sentence_ids: Vec<String>,
    pub source_text: String,
    pub start_time: u64,
    pub end_time: u64,
    pub duration_ms: u64,
    pub word_count: usize,
}

impl Paragraph {
    /// Build a paragraph from sentences in arrival order. Returns `None`
    /// for an empty slice.
    pub fn from_sentences(sentences: &[Sentence]) -> Option<Self> {
        if sentences.is_empty() {
            return None;
        }

        let source_text = sentences
            .iter()
            .map(|s| s.source_text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let start_time = sentences.first().map(|s| s.start_time).unwrap_or(0);
        let end_time = sentences.last().map(|s| s.end_time).unwrap_or(0);

        Some(Self {
            id: Uuid::new_v4().to_string(),
            sentence_ids: sentences.iter().map(|s| s.id.clone()).collect(),
            word_count: source_text.split_whitespace().count(),
            source_text,
            start_time,
            end_time,
            duration_ms: end_time.saturating_sub(start_time),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(text: &str, start: u64, end: u64, confidence: f32) -> TranscriptFragment {
        TranscriptFragment::new(text, confidence, true, start, end, Language::new("en"))
    }

    #[test]
    fn test_ends_sentence() {
        assert!(ends_sentence("Hello world."));
        assert!(ends_sentence("How are you? "));
        assert!(ends_sentence("すごい！"));
        assert!(ends_sentence("そうです。"));
        assert!(!ends_sentence("Hello world"));
        assert!(!ends_sentence(""));
    }

    #[test]
    fn test_sentence_join_invariant() {
        let frags = vec![
            fragment(" Hello ", 0, 400, 0.9),
            fragment("world.", 400, 900, 0.7),
        ];
        let sentence = Sentence::from_fragments(&frags).unwrap();
        assert_eq!(sentence.source_text, "Hello world.");
        assert_eq!(sentence.fragment_count, 2);
        assert_eq!(sentence.start_time, 0);
        assert_eq!(sentence.end_time, 900);
        assert!((sentence.avg_confidence - 0.8).abs() < 1e-6);
        assert_eq!(sentence.fragment_ids.len(), 2);
    }

    #[test]
    fn test_sentence_rejects_blank() {
        assert!(Sentence::from_fragments(&[]).is_none());
        let blank = vec![fragment("   ", 0, 100, 0.0)];
        assert!(Sentence::from_fragments(&blank).is_none());
    }

    #[test]
    fn test_paragraph_word_count() {
        let frags_a = vec![fragment("Hello world.", 0, 1000, 0.9)];
        let frags_b = vec![fragment("How are you?", 1200, 2500, 0.9)];
        let sentences = vec![
            Sentence::from_fragments(&frags_a).unwrap(),
            Sentence::from_fragments(&frags_b).unwrap(),
        ];
        let paragraph = Paragraph::from_sentences(&sentences).unwrap();
        assert_eq!(paragraph.word_count, 5);
        assert_eq!(paragraph.duration_ms, 2500);
        assert_eq!(paragraph.source_text, "Hello world. How are you?");
    }
}
