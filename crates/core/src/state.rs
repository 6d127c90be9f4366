//! Pipeline lifecycle state

use serde::{Deserialize, Serialize};

/// Lifecycle state owned by the orchestrator. All other components are
/// reactive and never drive transitions themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Idle,
    Starting,
    Listening,
    Paused,
    Stopping,
    Error,
}

impl PipelineState {
    /// Legal transitions:
    /// `idle → starting → listening ⇄ paused`, `listening|paused → stopping
    /// → idle`, `any → error`, `error → idle` (explicit stop only).
    pub fn can_transition(self, to: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, to),
            (Idle, Starting)
                | (Starting, Listening)
                | (Listening, Paused)
                | (Paused, Listening)
                | (Listening, Stopping)
                | (Paused, Stopping)
                | (Starting, Stopping)
                | (Stopping, Idle)
                | (Error, Idle)
                | (_, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Listening => "listening",
            PipelineState::Paused => "paused",
            PipelineState::Stopping => "stopping",
            PipelineState::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Idle.can_transition(Starting));
        assert!(Starting.can_transition(Listening));
        assert!(Listening.can_transition(Paused));
        assert!(Paused.can_transition(Listening));
        assert!(Listening.can_transition(Stopping));
        assert!(Stopping.can_transition(Idle));
        assert!(Listening.can_transition(Error));
        assert!(Error.can_transition(Idle));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Idle.can_transition(Listening));
        assert!(!Paused.can_transition(Idle));
        assert!(!Error.can_transition(Listening));
        assert!(!Stopping.can_transition(Listening));
    }
}
