//! Translator: prompt shape, mode selection, timing, post-processing
//!
//! The realtime tier streams deltas so the first characters paint early;
//! the high tier runs non-streaming since total latency dominates there.
//! When source and target language are equal the LLM is bypassed entirely.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::backend::{BackendRequest, ReasoningEffort, TranslationBackend};
use crate::TranslateError;
use lectern_core::{QualityTier, TranslationDelta, TranslationRequest, TranslationResult};

/// Quote pairs stripped when they wrap the entire output
const QUOTE_PAIRS: [(char, char); 5] = [
    ('"', '"'),
    ('\'', '\''),
    ('\u{201C}', '\u{201D}'),
    ('\u{2018}', '\u{2019}'),
    ('「', '」'),
];

/// Remove one wrapping quote pair and trailing whitespace. Models
/// occasionally quote the whole translation despite the instruction.
fn postprocess(output: &str) -> String {
    let trimmed = output.trim();
    let mut chars = trimmed.chars();
    if let (Some(first), Some(last)) = (chars.next(), chars.next_back()) {
        for (open, close) in QUOTE_PAIRS {
            if first == open && last == close {
                return trimmed[first.len_utf8()..trimmed.len() - last.len_utf8()]
                    .trim_end()
                    .to_string();
            }
        }
    }
    trimmed.trim_end().to_string()
}

/// Invokes the LLM backend for one translation request
pub struct Translator {
    backend: Arc<dyn TranslationBackend>,
    max_output_tokens: u32,
    temperature: Option<f32>,
}

impl Translator {
    pub fn new(backend: Arc<dyn TranslationBackend>) -> Self {
        Self {
            backend,
            max_output_tokens: 1500,
            temperature: None,
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    fn backend_request(&self, request: &TranslationRequest) -> BackendRequest {
        BackendRequest {
            model: self.backend.model_for(request.quality_tier),
            system: format!(
                "Translate {} to {}. Output only the translation, no commentary, no explanation.",
                request.source_language, request.target_language
            ),
            user: request.source_text.clone(),
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
            reasoning_effort: match request.quality_tier {
                QualityTier::Realtime => Some(ReasoningEffort::Minimal),
                QualityTier::High => Some(ReasoningEffort::Low),
            },
        }
    }

    /// Translate one request. Realtime-tier deltas are forwarded to
    /// `delta_tx` as they arrive.
    pub async fn translate(
        &self,
        request: &TranslationRequest,
        delta_tx: Option<mpsc::Sender<TranslationDelta>>,
    ) -> Result<TranslationResult, TranslateError> {
        // Same-language short-circuit: no provider call, zero latency
        if request.source_language == request.target_language {
            return Ok(TranslationResult {
                request_id: request.request_id.clone(),
                source_unit_id: request.source_unit_id.clone(),
                source_text: request.source_text.clone(),
                target_text: request.source_text.clone(),
                source_language: request.source_language.clone(),
                target_language: request.target_language.clone(),
                model_id: String::new(),
                quality_tier: request.quality_tier,
                first_paint_ms: 0,
                complete_ms: 0,
            });
        }

        let backend_request = self.backend_request(request);
        let model_id = backend_request.model.clone();
        let start = Instant::now();

        let (raw_text, first_paint) = match request.quality_tier {
            QualityTier::Realtime => {
                let (raw_tx, mut raw_rx) = mpsc::channel::<String>(64);
                let forward = async {
                    let mut first_paint: Option<u64> = None;
                    while let Some(delta) = raw_rx.recv().await {
                        if first_paint.is_none() && !delta.trim().is_empty() {
                            first_paint = Some(start.elapsed().as_millis() as u64);
                        }
                        if let Some(tx) = &delta_tx {
                            let _ = tx
                                .send(TranslationDelta {
                                    request_id: request.request_id.clone(),
                                    source_unit_id: request.source_unit_id.clone(),
                                    delta,
                                    quality_tier: request.quality_tier,
                                })
                                .await;
                        }
                    }
                    first_paint
                };
                let (text, first_paint) = tokio::join!(
                    self.backend.complete_stream(&backend_request, raw_tx),
                    forward
                );
                (text?, first_paint)
            }
            QualityTier::High => (self.backend.complete(&backend_request).await?, None),
        };

        let complete_ms = start.elapsed().as_millis() as u64;
        let first_paint_ms = first_paint.unwrap_or(complete_ms).min(complete_ms);
        let target_text = postprocess(&raw_text);

        tracing::debug!(
            request_id = %request.request_id,
            tier = request.quality_tier.as_str(),
            first_paint_ms,
            complete_ms,
            "Translation complete"
        );

        Ok(TranslationResult {
            request_id: request.request_id.clone(),
            source_unit_id: request.source_unit_id.clone(),
            source_text: request.source_text.clone(),
            target_text,
            source_language: request.source_language.clone(),
            target_language: request.target_language.clone(),
            model_id,
            quality_tier: request.quality_tier,
            first_paint_ms,
            complete_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lectern_core::{Language, Priority};

    struct EchoBackend {
        reply: String,
    }

    #[async_trait]
    impl TranslationBackend for EchoBackend {
        async fn complete(&self, _request: &BackendRequest) -> Result<String, TranslateError> {
            Ok(self.reply.clone())
        }

        async fn complete_stream(
            &self,
            _request: &BackendRequest,
            tx: mpsc::Sender<String>,
        ) -> Result<String, TranslateError> {
            for chunk in self.reply.split_inclusive(' ') {
                let _ = tx.send(chunk.to_string()).await;
            }
            Ok(self.reply.clone())
        }

        fn model_for(&self, tier: QualityTier) -> String {
            match tier {
                QualityTier::Realtime => "fast".into(),
                QualityTier::High => "strong".into(),
            }
        }
    }

    fn request(tier: QualityTier, source: &str, target: &str) -> TranslationRequest {
        TranslationRequest::new(
            "req-1",
            "unit-1",
            "Hello world.",
            Language::new(source),
            Language::new(target),
            Priority::Normal,
            tier,
        )
    }

    #[test]
    fn test_postprocess_strips_wrapping_quotes() {
        assert_eq!(postprocess("\"Bonjour\""), "Bonjour");
        assert_eq!(postprocess("“Bonjour”"), "Bonjour");
        assert_eq!(postprocess("「こんにちは」"), "こんにちは");
        assert_eq!(postprocess("Bonjour  \n"), "Bonjour");
        // Unmatched quotes stay
        assert_eq!(postprocess("\"Bonjour"), "\"Bonjour");
        // Interior quotes stay
        assert_eq!(postprocess("He said \"hi\" today"), "He said \"hi\" today");
    }

    #[tokio::test]
    async fn test_same_language_short_circuit() {
        let translator = Translator::new(Arc::new(EchoBackend {
            reply: "should never be used".into(),
        }));
        let result = translator
            .translate(&request(QualityTier::Realtime, "en", "en"), None)
            .await
            .unwrap();
        assert_eq!(result.target_text, "Hello world.");
        assert_eq!(result.first_paint_ms, 0);
        assert_eq!(result.complete_ms, 0);
        assert!(result.model_id.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_forwards_deltas() {
        let translator = Translator::new(Arc::new(EchoBackend {
            reply: "Bonjour le monde.".into(),
        }));
        let (tx, mut rx) = mpsc::channel(16);
        let result = translator
            .translate(&request(QualityTier::Realtime, "en", "fr"), Some(tx))
            .await
            .unwrap();

        assert_eq!(result.target_text, "Bonjour le monde.");
        assert_eq!(result.model_id, "fast");
        assert!(result.first_paint_ms <= result.complete_ms);

        let mut collected = String::new();
        while let Ok(delta) = rx.try_recv() {
            assert_eq!(delta.request_id, "req-1");
            collected.push_str(&delta.delta);
        }
        assert_eq!(collected, "Bonjour le monde.");
    }

    #[tokio::test]
    async fn test_high_tier_uses_strong_model_without_deltas() {
        let translator = Translator::new(Arc::new(EchoBackend {
            reply: "\"Bonjour.\"".into(),
        }));
        let result = translator
            .translate(&request(QualityTier::High, "en", "fr"), None)
            .await
            .unwrap();
        assert_eq!(result.model_id, "strong");
        assert_eq!(result.target_text, "Bonjour.");
        assert_eq!(result.first_paint_ms, result.complete_ms);
    }
}
