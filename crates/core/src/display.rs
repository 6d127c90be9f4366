//! Display segment types for the three-line rolling view
//!
//! The display controller owns the mutable state; these are the immutable
//! snapshot types it emits. Opacity is authoritative output: the UI applies
//! it without interpretation.

use serde::{Deserialize, Serialize};

/// Visible display positions, most recent first, plus the transitional
/// fade-out slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Recent,
    Older,
    Oldest,
    Fading,
}

impl Slot {
    /// Target opacity for the settled slot
    pub fn target_opacity(&self) -> f32 {
        match self {
            Slot::Recent => 1.0,
            Slot::Older => 0.6,
            Slot::Oldest => 0.3,
            Slot::Fading => 0.0,
        }
    }
}

/// One line of the rolling display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySegment {
    /// Id of the backing transcript unit (fragment or sentence)
    pub id: String,
    pub source_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_text: Option<String>,
    pub source_is_final: bool,
    /// Wall-clock milliseconds
    pub created_at: u64,
    pub updated_at: u64,
    pub opacity: f32,
    pub slot: Slot,
}

/// Full snapshot of the display after a change, ordered recent → fading
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DisplaySnapshot {
    pub segments: Vec<DisplaySegment>,
}

impl DisplaySnapshot {
    pub fn segment_in(&self, slot: Slot) -> Option<&DisplaySegment> {
        self.segments.iter().find(|s| s.slot == slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_serde() {
        assert_eq!(serde_json::to_string(&Slot::Oldest).unwrap(), "\"oldest\"");
    }

    #[test]
    fn test_opacity_ordering() {
        assert!(Slot::Recent.target_opacity() > Slot::Older.target_opacity());
        assert!(Slot::Older.target_opacity() > Slot::Oldest.target_opacity());
        assert!(Slot::Oldest.target_opacity() > Slot::Fading.target_opacity());
    }
}
