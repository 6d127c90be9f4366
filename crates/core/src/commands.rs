//! Command surface for the orchestration collaborator

use serde::{Deserialize, Serialize};

use crate::language::Language;

/// Commands accepted by the pipeline orchestrator. The `correlation_id` of
/// a command is stamped onto every event derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Start(StartCommand),
    Pause,
    Resume,
    Stop,
    TranslateUserText(TranslateUserText),
}

/// Session start parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartCommand {
    pub source_language: Language,
    pub target_language: Language,
    pub session_id: String,
    pub correlation_id: String,
    /// Optional settings snapshot for this session. Kept as raw JSON here
    /// so the command surface stays independent of the settings schema;
    /// the orchestrator deserializes and validates it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Ad-hoc translation of user text (e.g. a memo). Scheduled at high
/// priority in the realtime tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslateUserText {
    pub text: String,
    pub source_language: Language,
    pub target_language: Language,
    pub correlation_id: String,
}

/// Synchronous command outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tagging() {
        let cmd = Command::Start(StartCommand {
            source_language: Language::new("en"),
            target_language: Language::new("ja"),
            session_id: "s1".into(),
            correlation_id: "c1".into(),
            config: None,
        });
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["command"], "start");
        assert_eq!(value["source_language"], "en");

        let stop: Command = serde_json::from_value(serde_json::json!({"command": "stop"})).unwrap();
        assert_eq!(stop, Command::Stop);
    }

    #[test]
    fn test_response_helpers() {
        assert!(CommandResponse::ok().success);
        let fail = CommandResponse::fail("nope");
        assert!(!fail.success);
        assert_eq!(fail.error.as_deref(), Some("nope"));
    }
}
