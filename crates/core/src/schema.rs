//! Bus event schema (v1)
//!
//! The event bus validates every serialized envelope against this schema on
//! emit; receive boundaries may re-validate. The schema pins the envelope
//! shape, the closed `kind` set, and the key payload fields per kind.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

static SCHEMA_VALUE: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "lectern-event-v1",
        "type": "object",
        "required": ["version", "id", "seq", "ts_ms", "kind", "payload"],
        "properties": {
            "version": { "const": 1 },
            "id": { "type": "string", "minLength": 1 },
            "seq": { "type": "integer", "minimum": 0 },
            "ts_ms": { "type": "integer", "minimum": 0 },
            "correlation_id": { "type": "string" },
            "kind": {
                "enum": [
                    "fragment", "sentence", "paragraph",
                    "translation_delta", "translation_complete",
                    "display_update", "summary", "vocabulary",
                    "final_report", "status", "error", "stats"
                ]
            },
            "payload": { "type": "object" }
        },
        "allOf": [
            {
                "if": { "properties": { "kind": { "const": "fragment" } } },
                "then": {
                    "properties": {
                        "payload": {
                            "required": ["id", "text", "confidence", "is_final",
                                         "start_ms", "end_ms", "language"],
                            "properties": {
                                "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
                            }
                        }
                    }
                }
            },
            {
                "if": { "properties": { "kind": { "const": "sentence" } } },
                "then": {
                    "properties": {
                        "payload": {
                            "required": ["id", "fragment_ids", "source_text",
                                         "source_language", "fragment_count"],
                            "properties": {
                                "fragment_ids": { "type": "array", "minItems": 1 }
                            }
                        }
                    }
                }
            },
            {
                "if": { "properties": { "kind": { "const": "paragraph" } } },
                "then": {
                    "properties": {
                        "payload": {
                            "required": ["id", "sentence_ids", "source_text", "word_count"]
                        }
                    }
                }
            },
            {
                "if": { "properties": { "kind": { "const": "translation_delta" } } },
                "then": {
                    "properties": {
                        "payload": {
                            "required": ["request_id", "source_unit_id", "delta", "quality_tier"]
                        }
                    }
                }
            },
            {
                "if": { "properties": { "kind": { "const": "translation_complete" } } },
                "then": {
                    "properties": {
                        "payload": {
                            "required": ["request_id", "source_unit_id", "source_text",
                                         "target_text", "source_language", "target_language",
                                         "model_id", "quality_tier",
                                         "first_paint_ms", "complete_ms"]
                        }
                    }
                }
            },
            {
                "if": { "properties": { "kind": { "const": "display_update" } } },
                "then": {
                    "properties": {
                        "payload": { "required": ["segments"] }
                    }
                }
            },
            {
                "if": { "properties": { "kind": { "const": "status" } } },
                "then": {
                    "properties": {
                        "payload": { "required": ["status"] }
                    }
                }
            },
            {
                "if": { "properties": { "kind": { "const": "error" } } },
                "then": {
                    "properties": {
                        "payload": { "required": ["code", "message", "recoverable"] }
                    }
                }
            }
        ]
    })
});

/// Compiled v1 event schema
pub static EVENT_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::compile(&SCHEMA_VALUE).expect("event schema v1 is well-formed")
});

/// Validate a serialized envelope; returns the first violation message
pub fn validate_event(value: &Value) -> Result<(), String> {
    EVENT_SCHEMA.validate(value).map_err(|mut errors| {
        errors
            .next()
            .map(|e| format!("{} at {}", e, e.instance_path))
            .unwrap_or_else(|| "unknown schema violation".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ErrorPayload};
    use crate::events::{EventEnvelope, PipelineEvent, StatusPayload};
    use crate::language::Language;
    use crate::state::PipelineState;
    use crate::transcript::TranscriptFragment;

    #[test]
    fn test_valid_events_pass() {
        let events = vec![
            PipelineEvent::Fragment(TranscriptFragment::new(
                "hi",
                0.5,
                true,
                0,
                100,
                Language::new("en"),
            )),
            PipelineEvent::Status(StatusPayload::State {
                state: PipelineState::Listening,
            }),
            PipelineEvent::Error(ErrorPayload::new(ErrorCode::Internal, "x")),
        ];
        for (seq, event) in events.into_iter().enumerate() {
            let envelope = EventEnvelope::new(seq as u64, None, event);
            let value = serde_json::to_value(&envelope).unwrap();
            assert!(validate_event(&value).is_ok(), "rejected: {}", value);
        }
    }

    #[test]
    fn test_wrong_version_fails() {
        let envelope = EventEnvelope::new(
            0,
            None,
            PipelineEvent::Status(StatusPayload::Connection {
                connected: true,
                detail: None,
            }),
        );
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["version"] = serde_json::json!(2);
        assert!(validate_event(&value).is_err());
    }

    #[test]
    fn test_unknown_kind_fails() {
        let value = serde_json::json!({
            "version": 1, "id": "x", "seq": 0, "ts_ms": 0,
            "kind": "telemetry", "payload": {}
        });
        assert!(validate_event(&value).is_err());
    }

    #[test]
    fn test_out_of_range_confidence_fails() {
        let fragment = TranscriptFragment::new("hi", 0.5, true, 0, 100, Language::new("en"));
        let envelope = EventEnvelope::new(0, None, PipelineEvent::Fragment(fragment));
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["payload"]["confidence"] = serde_json::json!(1.5);
        assert!(validate_event(&value).is_err());
    }
}
