//! Display controller
//!
//! Keeps the three-line rolling visible state: `recent`, `older`, `oldest`,
//! plus a transitional `fading` slot on the way out. New text that is
//! sufficiently similar to the current `recent` updates it in place, which
//! absorbs the natural growth of interim transcripts; dissimilar text
//! shifts the stack. Opacity is computed at snapshot time and is
//! authoritative for the UI.

use tokio::time::Instant;

use lectern_config::DisplayConfig;
use lectern_core::{now_ms, similarity, DisplaySegment, DisplaySnapshot, Slot};

/// How long a fading segment lingers before removal
const FADING_LINGER_MS: u64 = 3_000;

#[derive(Debug, Clone)]
struct Line {
    id: String,
    source_text: String,
    target_text: Option<String>,
    source_is_final: bool,
    created_ms: u64,
    updated_ms: u64,
    admitted_at: Instant,
    min_show_until: Instant,
    demoted_at: Option<Instant>,
}

pub struct DisplayController {
    config: DisplayConfig,
    recent: Option<Line>,
    older: Option<Line>,
    oldest: Option<Line>,
    fading: Option<Line>,
}

impl DisplayController {
    pub fn new(config: DisplayConfig) -> Self {
        Self {
            config,
            recent: None,
            older: None,
            oldest: None,
            fading: None,
        }
    }

    /// Admit new source text. Similar text merges into `recent`; otherwise
    /// the stack shifts and the oldest line starts fading out.
    pub fn admit(&mut self, unit_id: &str, text: &str, is_final: bool) {
        let now = Instant::now();

        if let Some(recent) = &mut self.recent {
            if similarity::ratio(text, &recent.source_text) >= self.config.similarity_threshold {
                recent.id = unit_id.to_string();
                recent.source_text = text.to_string();
                recent.source_is_final = is_final;
                recent.updated_ms = now_ms();
                recent.min_show_until = recent
                    .min_show_until
                    .max(now + std::time::Duration::from_millis(self.config.min_show_ms));
                return;
            }
        }

        // Shift the stack; the fading slot holds at most one line
        if let Some(mut demoted) = self.oldest.take() {
            demoted.demoted_at = Some(now);
            self.fading = Some(demoted);
        }
        self.oldest = self.older.take();
        self.older = self.recent.take();

        let wall = now_ms();
        self.recent = Some(Line {
            id: unit_id.to_string(),
            source_text: text.to_string(),
            target_text: None,
            source_is_final: is_final,
            created_ms: wall,
            updated_ms: wall,
            admitted_at: now,
            min_show_until: now + std::time::Duration::from_millis(self.config.min_show_ms),
            demoted_at: None,
        });
    }

    /// Update a segment's translation wherever it currently sits. The
    /// update extends the minimum-display window. Returns whether a
    /// segment with that id was found.
    pub fn apply_translation(&mut self, unit_id: &str, target_text: &str) -> bool {
        let now = Instant::now();
        let min_show = std::time::Duration::from_millis(self.config.min_show_ms);
        for line in [
            &mut self.recent,
            &mut self.older,
            &mut self.oldest,
            &mut self.fading,
        ]
        .into_iter()
        .flatten()
        {
            if line.id == unit_id {
                line.target_text = Some(target_text.to_string());
                line.updated_ms = now_ms();
                line.min_show_until = line.min_show_until.max(now + min_show);
                return true;
            }
        }
        false
    }

    /// Drop the fading line once its linger and minimum-display windows
    /// have both passed. Returns whether anything changed.
    pub fn expire(&mut self) -> bool {
        let now = Instant::now();
        if let Some(fading) = &self.fading {
            let linger_over = fading
                .demoted_at
                .map(|at| now >= at + std::time::Duration::from_millis(FADING_LINGER_MS))
                .unwrap_or(true);
            if linger_over && now >= fading.min_show_until {
                self.fading = None;
                return true;
            }
        }
        false
    }

    /// When the next `expire` call could change state
    pub fn expire_deadline(&self) -> Option<Instant> {
        let fading = self.fading.as_ref()?;
        let linger = fading.demoted_at? + std::time::Duration::from_millis(FADING_LINGER_MS);
        Some(linger.max(fading.min_show_until))
    }

    /// Full snapshot, ordered recent → fading, with opacities computed now
    pub fn snapshot(&self) -> DisplaySnapshot {
        let now = Instant::now();
        let mut segments = Vec::with_capacity(4);
        for (line, slot) in [
            (&self.recent, Slot::Recent),
            (&self.older, Slot::Older),
            (&self.oldest, Slot::Oldest),
            (&self.fading, Slot::Fading),
        ] {
            if let Some(line) = line {
                segments.push(DisplaySegment {
                    id: line.id.clone(),
                    source_text: line.source_text.clone(),
                    target_text: line.target_text.clone(),
                    source_is_final: line.source_is_final,
                    created_at: line.created_ms,
                    updated_at: line.updated_ms,
                    opacity: self.opacity(line, slot, now),
                    slot,
                });
            }
        }
        DisplaySnapshot { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_none()
            && self.older.is_none()
            && self.oldest.is_none()
            && self.fading.is_none()
    }

    pub fn clear(&mut self) {
        self.recent = None;
        self.older = None;
        self.oldest = None;
        self.fading = None;
    }

    fn opacity(&self, line: &Line, slot: Slot, now: Instant) -> f32 {
        match slot {
            Slot::Recent => {
                // Fade-in from admission
                let elapsed = now.saturating_duration_since(line.admitted_at).as_millis() as f32;
                let progress = (elapsed / self.config.fade_in_ms.max(1) as f32).min(1.0);
                Slot::Recent.target_opacity() * progress
            }
            Slot::Older | Slot::Oldest => slot.target_opacity(),
            Slot::Fading => {
                // Fade-out from the oldest opacity toward zero
                let since = line
                    .demoted_at
                    .map(|at| now.saturating_duration_since(at).as_millis() as f32)
                    .unwrap_or(f32::MAX);
                let progress = (since / self.config.fade_out_ms.max(1) as f32).min(1.0);
                Slot::Oldest.target_opacity() * (1.0 - progress)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller() -> DisplayController {
        DisplayController::new(DisplayConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_admission_lands_in_recent() {
        let mut display = controller();
        display.admit("u1", "Hello", false);

        let snapshot = display.snapshot();
        assert_eq!(snapshot.segments.len(), 1);
        let segment = snapshot.segment_in(Slot::Recent).unwrap();
        assert_eq!(segment.id, "u1");
        assert!(!segment.source_is_final);
        // Fade-in just started
        assert!(segment.opacity < 0.1);

        tokio::time::advance(Duration::from_millis(250)).await;
        let segment = display.snapshot();
        assert_eq!(segment.segment_in(Slot::Recent).unwrap().opacity, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_similar_text_merges_into_recent() {
        let mut display = controller();
        display.admit("frag-1", "the quick brown fox", false);
        display.admit("frag-2", "the quick brown fox jumps", false);
        display.admit("sent-1", "the quick brown fox jumps over", true);

        let snapshot = display.snapshot();
        assert_eq!(snapshot.segments.len(), 1);
        let recent = snapshot.segment_in(Slot::Recent).unwrap();
        assert_eq!(recent.id, "sent-1");
        assert_eq!(recent.source_text, "the quick brown fox jumps over");
        assert!(recent.source_is_final);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dissimilar_text_shifts_stack() {
        let mut display = controller();
        display.admit("s1", "Completely first sentence here", true);
        display.admit("s2", "Nothing alike whatsoever today", true);
        display.admit("s3", "Third topic entirely different", true);

        let snapshot = display.snapshot();
        assert_eq!(snapshot.segment_in(Slot::Recent).unwrap().id, "s3");
        assert_eq!(snapshot.segment_in(Slot::Older).unwrap().id, "s2");
        assert_eq!(snapshot.segment_in(Slot::Oldest).unwrap().id, "s1");
        assert!(snapshot.segment_in(Slot::Fading).is_none());

        // A fourth admission demotes s1 to fading
        display.admit("s4", "Yet another unrelated line", true);
        let snapshot = display.snapshot();
        assert_eq!(snapshot.segment_in(Slot::Fading).unwrap().id, "s1");
        assert_eq!(snapshot.segments.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opacities_non_increasing_by_recency() {
        let mut display = controller();
        display.admit("s1", "Completely first sentence here", true);
        display.admit("s2", "Nothing alike whatsoever today", true);
        display.admit("s3", "Third topic entirely different", true);
        tokio::time::advance(Duration::from_millis(500)).await;

        let snapshot = display.snapshot();
        let recent = snapshot.segment_in(Slot::Recent).unwrap().opacity;
        let older = snapshot.segment_in(Slot::Older).unwrap().opacity;
        let oldest = snapshot.segment_in(Slot::Oldest).unwrap().opacity;
        assert!(recent >= older && older >= oldest);
        assert_eq!(recent, 1.0);
        assert_eq!(older, 0.6);
        assert_eq!(oldest, 0.3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fading_interpolates_and_expires() {
        let mut display = controller();
        for (id, text) in [
            ("s1", "Completely first sentence here"),
            ("s2", "Nothing alike whatsoever today"),
            ("s3", "Third topic entirely different"),
            ("s4", "Yet another unrelated line"),
        ] {
            display.admit(id, text, true);
        }

        tokio::time::advance(Duration::from_millis(150)).await;
        let opacity = display
            .snapshot()
            .segment_in(Slot::Fading)
            .unwrap()
            .opacity;
        assert!(opacity > 0.0 && opacity < 0.3);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(
            display.snapshot().segment_in(Slot::Fading).unwrap().opacity,
            0.0
        );

        // Not yet removable: linger window still open
        assert!(!display.expire());
        tokio::time::advance(Duration::from_millis(3_000)).await;
        assert!(display.expire());
        assert!(display.snapshot().segment_in(Slot::Fading).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_translation_update_in_place() {
        let mut display = controller();
        display.admit("s1", "Hello world.", true);
        display.admit("s2", "Nothing alike whatsoever today", true);

        assert!(display.apply_translation("s1", "こんにちは世界。"));
        assert!(!display.apply_translation("missing", "x"));

        let snapshot = display.snapshot();
        let older = snapshot.segment_in(Slot::Older).unwrap();
        assert_eq!(older.target_text.as_deref(), Some("こんにちは世界。"));
        assert!(older.updated_at >= older.created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_multiplicity_invariant() {
        let mut display = controller();
        for i in 0..8 {
            display.admit(
                &format!("s{}", i),
                &format!("Totally distinct sentence number {} with words", i * 37),
                true,
            );
        }
        let snapshot = display.snapshot();
        for slot in [Slot::Recent, Slot::Older, Slot::Oldest, Slot::Fading] {
            let count = snapshot.segments.iter().filter(|s| s.slot == slot).count();
            assert!(count <= 1, "slot {:?} has {} segments", slot, count);
        }
    }
}
