//! Sentence combiner
//!
//! Accumulates final fragments and closes a sentence on the earliest of:
//! a trailing sentence terminator, the fragment-count cap, or the idle
//! window elapsing without a new final fragment. Interim fragments are
//! ignored entirely. The utterance-end hint and pipeline stop force-flush
//! the accumulator.

use tokio::time::Instant;

use lectern_config::SentenceConfig;
use lectern_core::{ends_sentence, Sentence, TranscriptFragment};

pub struct SentenceCombiner {
    config: SentenceConfig,
    pending: Vec<TranscriptFragment>,
    last_final_at: Option<Instant>,
}

impl SentenceCombiner {
    pub fn new(config: SentenceConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            last_final_at: None,
        }
    }

    /// Accept a fragment; returns a closed sentence when a trigger fires
    pub fn push(&mut self, fragment: TranscriptFragment) -> Option<Sentence> {
        if !fragment.is_final {
            return None;
        }

        let terminated = ends_sentence(&fragment.text);
        self.pending.push(fragment);
        self.last_final_at = Some(Instant::now());

        if terminated || self.pending.len() >= self.config.max_fragments {
            self.close()
        } else {
            None
        }
    }

    /// When the idle trigger would fire, given the current accumulator
    pub fn idle_deadline(&self) -> Option<Instant> {
        let last = self.last_final_at?;
        if self.pending.is_empty() {
            return None;
        }
        Some(last + std::time::Duration::from_millis(self.config.idle_ms))
    }

    /// Force-close the accumulator (idle trigger, utterance-end hint, stop)
    pub fn flush(&mut self) -> Option<Sentence> {
        self.close()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn close(&mut self) -> Option<Sentence> {
        if self.pending.is_empty() {
            return None;
        }
        let fragments = std::mem::take(&mut self.pending);
        self.last_final_at = None;
        let sentence = Sentence::from_fragments(&fragments);
        if sentence.is_none() {
            tracing::debug!("Discarding blank accumulator of {} fragments", fragments.len());
        }
        sentence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::Language;

    fn fragment(text: &str, is_final: bool, start: u64, end: u64) -> TranscriptFragment {
        TranscriptFragment::new(text, 0.9, is_final, start, end, Language::new("en"))
    }

    fn combiner() -> SentenceCombiner {
        SentenceCombiner::new(SentenceConfig::default())
    }

    #[test]
    fn test_terminator_closes_single_fragment() {
        let mut combiner = combiner();
        let sentence = combiner.push(fragment("Hello world.", true, 0, 900)).unwrap();
        assert_eq!(sentence.source_text, "Hello world.");
        assert_eq!(sentence.fragment_count, 1);
        assert!(combiner.is_empty());
    }

    #[test]
    fn test_accumulates_until_terminator() {
        let mut combiner = combiner();
        assert!(combiner.push(fragment("Hello", true, 0, 400)).is_none());
        assert!(combiner.push(fragment("there", true, 400, 700)).is_none());
        let sentence = combiner.push(fragment("world.", true, 700, 1100)).unwrap();
        assert_eq!(sentence.source_text, "Hello there world.");
        assert_eq!(sentence.fragment_ids.len(), 3);
    }

    #[test]
    fn test_cjk_terminator() {
        let mut combiner = combiner();
        let sentence = combiner.push(fragment("そうです。", true, 0, 500)).unwrap();
        assert_eq!(sentence.source_text, "そうです。");
    }

    #[test]
    fn test_interim_fragments_ignored() {
        let mut combiner = combiner();
        assert!(combiner.push(fragment("Hello wor", false, 0, 500)).is_none());
        assert!(combiner.is_empty());
        assert!(combiner.idle_deadline().is_none());
    }

    #[test]
    fn test_fragment_cap_closes() {
        let mut combiner = SentenceCombiner::new(SentenceConfig {
            max_fragments: 3,
            ..Default::default()
        });
        assert!(combiner.push(fragment("a", true, 0, 100)).is_none());
        assert!(combiner.push(fragment("b", true, 100, 200)).is_none());
        let sentence = combiner.push(fragment("c", true, 200, 300)).unwrap();
        assert_eq!(sentence.source_text, "a b c");
    }

    #[test]
    fn test_flush_returns_pending() {
        let mut combiner = combiner();
        combiner.push(fragment("unfinished thought", true, 0, 800));
        let sentence = combiner.flush().unwrap();
        assert_eq!(sentence.source_text, "unfinished thought");
        assert!(combiner.flush().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_tracks_last_final() {
        let mut combiner = combiner();
        assert!(combiner.idle_deadline().is_none());

        combiner.push(fragment("waiting", true, 0, 300));
        let deadline = combiner.idle_deadline().unwrap();
        let expected = Instant::now() + std::time::Duration::from_millis(2000);
        assert!(deadline <= expected);
        assert!(deadline > Instant::now());
    }
}
