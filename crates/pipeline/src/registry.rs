//! Segment registry
//!
//! Maps child unit ids to their parents (fragment → sentence, sentence →
//! paragraph) so late-arriving translation results can be associated with
//! the right unit without back-pointers. Purely in-memory; cleared when the
//! session stops.

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct SegmentRegistry {
    parents: DashMap<String, String>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, child_id: impl Into<String>, parent_id: impl Into<String>) {
        self.parents.insert(child_id.into(), parent_id.into());
    }

    pub fn resolve(&self, child_id: &str) -> Option<String> {
        self.parents.get(child_id).map(|entry| entry.clone())
    }

    /// Follow the chain to the topmost ancestor (fragment → paragraph)
    pub fn resolve_root(&self, child_id: &str) -> Option<String> {
        let mut current = self.resolve(child_id)?;
        while let Some(parent) = self.resolve(&current) {
            current = parent;
        }
        Some(current)
    }

    pub fn clear(&self) {
        self.parents.clear();
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}
