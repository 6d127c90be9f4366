//! Translation request/result types and queue statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::language::Language;

/// Scheduling priority of a translation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Translation quality tier. `Realtime` favors first-paint latency with a
/// fast model; `High` favors accuracy with a stronger model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Realtime,
    High,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Realtime => "realtime",
            QualityTier::High => "high",
        }
    }
}

/// A unit of work for the translation queue. `request_id` is the
/// idempotence key: enqueueing the same id twice dispatches at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub request_id: String,
    /// Id of the sentence/paragraph/ad-hoc unit being translated
    pub source_unit_id: String,
    pub source_text: String,
    pub source_language: Language,
    pub target_language: Language,
    pub priority: Priority,
    pub quality_tier: QualityTier,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl TranslationRequest {
    pub fn new(
        request_id: impl Into<String>,
        source_unit_id: impl Into<String>,
        source_text: impl Into<String>,
        source_language: Language,
        target_language: Language,
        priority: Priority,
        quality_tier: QualityTier,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            source_unit_id: source_unit_id.into(),
            source_text: source_text.into(),
            source_language,
            target_language,
            priority,
            quality_tier,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// One streamed text delta for an in-flight translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationDelta {
    pub request_id: String,
    pub source_unit_id: String,
    pub delta: String,
    pub quality_tier: QualityTier,
}

/// A completed translation. `source_text` and `source_language` are echoed
/// exactly as provided — they are contract fields and are never renamed or
/// localized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub request_id: String,
    pub source_unit_id: String,
    pub source_text: String,
    pub target_text: String,
    pub source_language: Language,
    pub target_language: Language,
    pub model_id: String,
    pub quality_tier: QualityTier,
    /// Milliseconds from dispatch to first non-empty delta
    pub first_paint_ms: u64,
    /// Milliseconds from dispatch to completion
    pub complete_ms: u64,
}

/// Per-priority queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePriorityStats {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Queue statistics snapshot, emitted on the `stats` event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub high: QueuePriorityStats,
    pub normal: QueuePriorityStats,
    pub low: QueuePriorityStats,
}

impl QueueStats {
    pub fn for_priority(&self, priority: Priority) -> &QueuePriorityStats {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    pub fn for_priority_mut(&mut self, priority: Priority) -> &mut QueuePriorityStats {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    pub fn total_in_flight(&self) -> usize {
        self.high.in_flight + self.normal.in_flight + self.low.in_flight
    }

    pub fn total_pending(&self) -> usize {
        self.high.pending + self.normal.pending + self.low.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_serde() {
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "\"low\"");
        assert_eq!(
            serde_json::to_string(&QualityTier::Realtime).unwrap(),
            "\"realtime\""
        );
    }

    #[test]
    fn test_priority_order() {
        // High sorts before Normal sorts before Low
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn test_stats_accessors() {
        let mut stats = QueueStats::default();
        stats.for_priority_mut(Priority::Normal).in_flight = 2;
        stats.for_priority_mut(Priority::Low).pending = 5;
        assert_eq!(stats.total_in_flight(), 2);
        assert_eq!(stats.total_pending(), 5);
        assert_eq!(stats.for_priority(Priority::Normal).in_flight, 2);
    }
}
