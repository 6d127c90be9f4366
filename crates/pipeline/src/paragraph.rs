//! Paragraph builder
//!
//! Groups sentences into paragraphs for the low-priority high-quality
//! retranslation path. A paragraph closes on the earliest of: content
//! duration reaching the cap, a silence gap following a mature paragraph,
//! or session stop. Durations compare stream timestamps; the wall-clock
//! cap deadline is exposed for sessions that go quiet mid-paragraph.

use tokio::time::Instant;

use lectern_config::ParagraphConfig;
use lectern_core::{Paragraph, Sentence};

pub struct ParagraphBuilder {
    config: ParagraphConfig,
    pending: Vec<Sentence>,
    opened_at: Option<Instant>,
}

impl ParagraphBuilder {
    pub fn new(config: ParagraphConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            opened_at: None,
        }
    }

    /// Accept a sentence; may close the paragraph built so far (silence
    /// gap) and/or the one including this sentence (duration cap).
    pub fn push(&mut self, sentence: Sentence) -> Vec<Paragraph> {
        let mut closed = Vec::new();

        if let (Some(first), Some(last)) = (self.pending.first(), self.pending.last()) {
            let gap = sentence.start_time.saturating_sub(last.end_time);
            let duration = last.end_time.saturating_sub(first.start_time);
            if gap > self.config.silence_ms && duration >= self.config.min_ms {
                closed.extend(self.flush());
            }
        }

        if self.pending.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.pending.push(sentence);

        let first_start = self.pending[0].start_time;
        let last_end = self.pending.last().expect("just pushed").end_time;
        if last_end.saturating_sub(first_start) >= self.config.max_ms {
            closed.extend(self.flush());
        }

        closed
    }

    /// Wall-clock deadline for the duration cap, for quiet streams
    pub fn max_deadline(&self) -> Option<Instant> {
        let opened = self.opened_at?;
        Some(opened + std::time::Duration::from_millis(self.config.max_ms))
    }

    /// Force-close the current paragraph (duration deadline, stop)
    pub fn flush(&mut self) -> Option<Paragraph> {
        if self.pending.is_empty() {
            return None;
        }
        let sentences = std::mem::take(&mut self.pending);
        self.opened_at = None;
        Paragraph::from_sentences(&sentences)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
