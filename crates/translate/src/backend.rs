//! LLM provider backend
//!
//! The provider accepts `{model, input: [{role, content}...],
//! max_output_tokens, stream, reasoning?, temperature?}` and returns either
//! a single `output_text` or a stream of chunks carrying incremental
//! `delta` strings with a terminal chunk. These field names are provider
//! contract and are never renamed.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::TranslateError;
use lectern_config::TranslatorConfig;
use lectern_core::QualityTier;

/// Reasoning effort hint passed to models that support it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    High,
}

/// One backend invocation
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// The capability the queue and translator depend on: something that can
/// turn a prompt into text, eagerly or as deltas.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    /// Non-streaming completion
    async fn complete(&self, request: &BackendRequest) -> Result<String, TranslateError>;

    /// Streaming completion. Deltas go to `tx`; the full text is returned.
    async fn complete_stream(
        &self,
        request: &BackendRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String, TranslateError>;

    /// Model id serving the given quality tier
    fn model_for(&self, tier: QualityTier) -> String;
}

/// HTTP backend against the configured provider endpoint
pub struct HttpBackend {
    client: Client,
    config: TranslatorConfig,
}

impl HttpBackend {
    pub fn new(config: TranslatorConfig) -> Result<Self, TranslateError> {
        if config.api_key.is_empty() && !config.endpoint.starts_with("http://localhost") {
            return Err(TranslateError::Configuration(
                "api key required for remote endpoints".into(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| TranslateError::Configuration(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn wire_request(&self, request: &BackendRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: request.model.clone(),
            input: vec![
                WireMessage {
                    role: "system",
                    content: request.system.clone(),
                },
                WireMessage {
                    role: "user",
                    content: request.user.clone(),
                },
            ],
            max_output_tokens: request.max_output_tokens,
            stream,
            reasoning: request
                .reasoning_effort
                .map(|effort| WireReasoning { effort }),
            temperature: request.temperature,
        }
    }

    async fn post(
        &self,
        request: &BackendRequest,
        stream: bool,
    ) -> Result<reqwest::Response, TranslateError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&self.wire_request(request, stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TranslateError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl TranslationBackend for HttpBackend {
    async fn complete(&self, request: &BackendRequest) -> Result<String, TranslateError> {
        let response = self.post(request, false).await?;
        let body: WireResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::InvalidResponse(e.to_string()))?;
        body.output_text
            .ok_or_else(|| TranslateError::InvalidResponse("missing output_text".into()))
    }

    async fn complete_stream(
        &self,
        request: &BackendRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String, TranslateError> {
        let response = self.post(request, true).await?;

        let mut full_text = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TranslateError::Network(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer.drain(..=line_end);

                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(json_str) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<WireStreamChunk>(json_str) else {
                    tracing::debug!(line = %json_str, "Ignoring unparseable stream chunk");
                    continue;
                };

                if let Some(delta) = event.delta {
                    if !delta.is_empty() {
                        full_text.push_str(&delta);
                        if tx.send(delta).await.is_err() {
                            // Receiver gone: the call was cancelled
                            return Ok(full_text);
                        }
                    }
                }
                // Terminal chunks may carry the authoritative full text
                if let Some(output_text) = event.output_text {
                    full_text = output_text;
                }
            }
        }

        Ok(full_text)
    }

    fn model_for(&self, tier: QualityTier) -> String {
        match tier {
            QualityTier::Realtime => self.config.model_realtime.clone(),
            QualityTier::High => self.config.model_high.clone(),
        }
    }
}

// Provider wire types

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    input: Vec<WireMessage>,
    max_output_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<WireReasoning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireReasoning {
    effort: ReasoningEffort,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    output_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    output_text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BackendRequest {
        BackendRequest {
            model: "fast-model".into(),
            system: "Translate en to ja. Output only the translation, no commentary, no explanation.".into(),
            user: "Hello".into(),
            max_output_tokens: 1500,
            temperature: None,
            reasoning_effort: Some(ReasoningEffort::Minimal),
        }
    }

    #[test]
    fn test_backend_requires_api_key_for_remote() {
        let config = TranslatorConfig::default();
        assert!(matches!(
            HttpBackend::new(config),
            Err(TranslateError::Configuration(_))
        ));

        let mut local = TranslatorConfig::default();
        local.endpoint = "http://localhost:8080/v1/responses".into();
        assert!(HttpBackend::new(local).is_ok());
    }

    #[test]
    fn test_wire_request_shape() {
        let mut config = TranslatorConfig::default();
        config.api_key = "k".into();
        config.temperature = Some(0.2);
        let backend = HttpBackend::new(config).unwrap();

        let mut req = request();
        req.temperature = Some(0.2);
        let wire = backend.wire_request(&req, true);
        let value = serde_json::to_value(&wire).unwrap();

        assert_eq!(value["model"], "fast-model");
        assert_eq!(value["input"][0]["role"], "system");
        assert_eq!(value["input"][1]["role"], "user");
        assert_eq!(value["input"][1]["content"], "Hello");
        assert_eq!(value["max_output_tokens"], 1500);
        assert_eq!(value["stream"], true);
        assert_eq!(value["reasoning"]["effort"], "minimal");
        assert_eq!(value["temperature"], 0.2);
    }

    #[test]
    fn test_wire_request_omits_absent_options() {
        let mut config = TranslatorConfig::default();
        config.api_key = "k".into();
        let backend = HttpBackend::new(config).unwrap();

        let mut req = request();
        req.reasoning_effort = None;
        req.temperature = None;
        let value = serde_json::to_value(backend.wire_request(&req, false)).unwrap();
        assert!(value.get("reasoning").is_none());
        assert!(value.get("temperature").is_none());
        assert_eq!(value["stream"], false);
    }

    #[test]
    fn test_model_for_tier() {
        let mut config = TranslatorConfig::default();
        config.api_key = "k".into();
        config.model_realtime = "fast".into();
        config.model_high = "strong".into();
        let backend = HttpBackend::new(config).unwrap();
        assert_eq!(backend.model_for(QualityTier::Realtime), "fast");
        assert_eq!(backend.model_for(QualityTier::High), "strong");
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let chunk: WireStreamChunk = serde_json::from_str(r#"{"delta": "こん"}"#).unwrap();
        assert_eq!(chunk.delta.as_deref(), Some("こん"));
        assert!(chunk.output_text.is_none());

        let terminal: WireStreamChunk =
            serde_json::from_str(r#"{"output_text": "こんにちは"}"#).unwrap();
        assert_eq!(terminal.output_text.as_deref(), Some("こんにちは"));
    }
}
