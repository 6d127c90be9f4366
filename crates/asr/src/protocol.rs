//! Recognizer wire protocol
//!
//! The recognizer speaks WebSocket: binary frames carry PCM16 audio out,
//! JSON text frames carry results back. This module owns the connection URL,
//! the message shapes, language/model resolution, and close-code
//! classification. Field names are provider contract and are not renamed.

use serde::Deserialize;

use crate::AsrError;
use lectern_config::{AsrConfig, AudioConfig};
use lectern_core::Language;

/// Protocol-level keep-alive message
pub const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;

/// Graceful end-of-stream message sent before closing
pub const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;

/// Languages the standard models transcribe natively
const NATIVE_LANGUAGES: &[&str] = &[
    "en", "es", "fr", "de", "it", "pt", "nl", "ja", "ko", "zh", "zh-cn", "zh-tw", "hi", "ru",
    "tr", "pl", "sv", "da", "no", "fi", "id", "ms", "th", "vi", "uk", "cs", "sk", "ro", "hu",
    "el", "bg", "ca", "et", "lv", "lt", "ta",
];

/// Token selecting the model's multilingual mode
const MULTILINGUAL_TOKEN: &str = "multi";

/// Model families that offer a multilingual mode
fn supports_multilingual(model: &str) -> bool {
    model.starts_with("nova-3")
}

/// Resolve the language query parameter for a model: the native tag when
/// supported, the multilingual token when the model offers one, otherwise
/// the session cannot serve this language.
pub fn resolve_language(model: &str, requested: &Language) -> Result<String, AsrError> {
    let tag = requested.as_str();
    if NATIVE_LANGUAGES.contains(&tag) || NATIVE_LANGUAGES.contains(&requested.primary()) {
        return Ok(tag.to_string());
    }
    if supports_multilingual(model) {
        return Ok(MULTILINGUAL_TOKEN.to_string());
    }
    Err(AsrError::UnsupportedLanguage {
        model: model.to_string(),
        language: tag.to_string(),
    })
}

/// Build the `wss://<host>/v1/listen?<query>` connection URL
pub fn listen_url(
    asr: &AsrConfig,
    audio: &AudioConfig,
    resolved_language: &str,
) -> String {
    let mut params: Vec<(&str, String)> = vec![
        ("model", asr.model.clone()),
        ("language", resolved_language.to_string()),
        ("interim_results", asr.interim.to_string()),
        ("endpointing", asr.endpointing_ms.to_string()),
        ("utterance_end_ms", asr.utterance_end_ms.to_string()),
        ("sample_rate", audio.sample_rate.to_string()),
        ("encoding", "linear16".to_string()),
        ("channels", "1".to_string()),
    ];
    if asr.smart_format {
        params.push(("smart_format", "true".to_string()));
    }
    if asr.punctuate {
        params.push(("punctuate", "true".to_string()));
    }
    if asr.no_delay {
        params.push(("no_delay", "true".to_string()));
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("wss://{}/v1/listen?{}", asr.host, query)
}

/// One transcript alternative
#[derive(Debug, Clone, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Result channel wrapper
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResultChannel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

/// Messages received from the recognizer
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Results {
        #[serde(default)]
        channel: ResultChannel,
        #[serde(default)]
        is_final: Option<bool>,
        /// Stream offset in seconds
        #[serde(default)]
        start: Option<f64>,
        /// Segment duration in seconds
        #[serde(default)]
        duration: Option<f64>,
        #[serde(default)]
        end: Option<f64>,
    },
    UtteranceEnd {
        /// Seconds
        #[serde(default)]
        last_word_end: Option<f64>,
    },
    Metadata {},
    SpeechStarted {},
    Error {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unparseable recognizer message");
                None
            }
        }
    }
}

/// Seconds-to-milliseconds conversion for provider timestamps
pub fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0).round() as u64
}

/// How a close code is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Normal closure or going-away; no reconnect
    Normal,
    /// Abnormal close; reconnect with backoff
    Recoverable,
    /// Protocol misuse; terminal
    BadRequest,
    /// Credential rejection; terminal
    Unauthorized,
}

/// Classify a WebSocket close code. 1000/1001 are normal; 4000 and 4001
/// bypass reconnection; everything else (including 1006 and custom 4xxx
/// such as 4008 timeout) is recoverable.
pub fn classify_close(code: Option<u16>) -> CloseClass {
    match code {
        Some(1000) | Some(1001) => CloseClass::Normal,
        Some(4000) => CloseClass::BadRequest,
        Some(4001) => CloseClass::Unauthorized,
        _ => CloseClass::Recoverable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_url_params() {
        let asr = AsrConfig::default();
        let audio = AudioConfig::default();
        let url = listen_url(&asr, &audio, "en");
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("model=nova-2"));
        assert!(url.contains("language=en"));
        assert!(url.contains("interim_results=true"));
        assert!(url.contains("endpointing=300"));
        assert!(url.contains("utterance_end_ms=1000"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("channels=1"));
        assert!(url.contains("smart_format=true"));
        assert!(!url.contains("no_delay"));
    }

    #[test]
    fn test_language_resolution() {
        assert_eq!(
            resolve_language("nova-2", &Language::new("ja")).unwrap(),
            "ja"
        );
        // Regional variant resolves through its primary subtag
        assert_eq!(
            resolve_language("nova-2", &Language::new("pt-BR")).unwrap(),
            "pt-br"
        );
        // Unsupported on nova-2, multilingual on nova-3
        assert_eq!(
            resolve_language("nova-3", &Language::new("sw")).unwrap(),
            "multi"
        );
        assert!(matches!(
            resolve_language("nova-2", &Language::new("sw")),
            Err(AsrError::UnsupportedLanguage { .. })
        ));
    }

    #[test]
    fn test_parse_results_message() {
        let json = r#"{
            "type": "Results",
            "channel": {"alternatives": [{"transcript": "hello world", "confidence": 0.93}]},
            "is_final": true,
            "start": 1.25,
            "duration": 0.8
        }"#;
        match ServerMessage::parse(json).unwrap() {
            ServerMessage::Results {
                channel,
                is_final,
                start,
                duration,
                ..
            } => {
                assert_eq!(channel.alternatives[0].transcript, "hello world");
                assert_eq!(channel.alternatives[0].confidence, Some(0.93));
                assert_eq!(is_final, Some(true));
                assert_eq!(secs_to_ms(start.unwrap()), 1250);
                assert_eq!(secs_to_ms(duration.unwrap()), 800);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_utterance_end() {
        let json = r#"{"type": "UtteranceEnd", "last_word_end": 3.1}"#;
        assert!(matches!(
            ServerMessage::parse(json),
            Some(ServerMessage::UtteranceEnd { last_word_end: Some(_) })
        ));
    }

    #[test]
    fn test_unknown_message_ignored() {
        assert!(ServerMessage::parse(r#"{"type": "Warning"}"#).is_none());
        assert!(ServerMessage::parse("not json").is_none());
    }

    #[test]
    fn test_close_classification() {
        assert_eq!(classify_close(Some(1000)), CloseClass::Normal);
        assert_eq!(classify_close(Some(1001)), CloseClass::Normal);
        assert_eq!(classify_close(Some(1006)), CloseClass::Recoverable);
        assert_eq!(classify_close(Some(4000)), CloseClass::BadRequest);
        assert_eq!(classify_close(Some(4001)), CloseClass::Unauthorized);
        assert_eq!(classify_close(Some(4008)), CloseClass::Recoverable);
        assert_eq!(classify_close(None), CloseClass::Recoverable);
    }
}
