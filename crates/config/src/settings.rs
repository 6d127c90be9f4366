//! Main settings module
//!
//! Layering: built-in defaults ← optional TOML file ← `LECTERN_*`
//! environment variables (`LECTERN_ASR__API_KEY` maps to `asr.api_key`).
//! Every threshold in the pipeline is configurable here; the defaults match
//! the documented behavior of each component.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ConfigError;

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub asr: AsrConfig,

    #[serde(default)]
    pub translator: TranslatorConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub sentence: SentenceConfig,

    #[serde(default)]
    pub paragraph: ParagraphConfig,

    #[serde(default)]
    pub coalescer: CoalescerConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Audio admission settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Frame duration in milliseconds
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_frame_ms() -> u32 {
    20
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
        }
    }
}

/// Recognizer session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsrConfig {
    /// Recognizer WebSocket host
    #[serde(default = "default_asr_host")]
    pub host: String,

    /// API key sent as `Authorization: Token <key>`
    #[serde(default)]
    pub api_key: String,

    /// Recognizer model id
    #[serde(default = "default_asr_model")]
    pub model: String,

    /// Trailing-silence window that ends an utterance, milliseconds
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,

    /// Utterance-end message window, milliseconds
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u32,

    /// Request interim results
    #[serde(default = "default_true")]
    pub interim: bool,

    #[serde(default = "default_true")]
    pub smart_format: bool,

    #[serde(default = "default_true")]
    pub punctuate: bool,

    #[serde(default)]
    pub no_delay: bool,
}

fn default_asr_host() -> String {
    "api.deepgram.com".to_string()
}

fn default_asr_model() -> String {
    "nova-2".to_string()
}

fn default_endpointing_ms() -> u32 {
    300
}

fn default_utterance_end_ms() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            host: default_asr_host(),
            api_key: String::new(),
            model: default_asr_model(),
            endpointing_ms: default_endpointing_ms(),
            utterance_end_ms: default_utterance_end_ms(),
            interim: true,
            smart_format: true,
            punctuate: true,
            no_delay: false,
        }
    }
}

/// Translator (LLM provider) settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslatorConfig {
    /// Provider endpoint accepting the `input` message array
    #[serde(default = "default_translator_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    /// Fast model for the realtime tier
    #[serde(default = "default_model_realtime")]
    pub model_realtime: String,

    /// Strong model for the high tier
    #[serde(default = "default_model_high")]
    pub model_high: String,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

fn default_translator_endpoint() -> String {
    "https://api.openai.com/v1/responses".to_string()
}

fn default_model_realtime() -> String {
    "gpt-5-nano".to_string()
}

fn default_model_high() -> String {
    "gpt-5-mini".to_string()
}

fn default_max_output_tokens() -> u32 {
    1500
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_translator_endpoint(),
            api_key: String::new(),
            model_realtime: default_model_realtime(),
            model_high: default_model_high(),
            max_output_tokens: default_max_output_tokens(),
            temperature: None,
        }
    }
}

/// Translation queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Global in-flight cap
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-item timeout from start of execution, milliseconds
    #[serde(default = "default_queue_timeout_ms")]
    pub timeout_ms: u64,

    /// Wait after which a low-priority item is promoted to normal
    #[serde(default = "default_low_starvation_ms")]
    pub low_starvation_ms: u64,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_queue_timeout_ms() -> u64 {
    7_000
}

fn default_low_starvation_ms() -> u64 {
    30_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_ms: default_queue_timeout_ms(),
            low_starvation_ms: default_low_starvation_ms(),
        }
    }
}

/// Sentence combiner settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentenceConfig {
    /// Fragment count that force-closes a sentence
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,

    /// Idle window without a new final fragment that closes a sentence
    #[serde(default = "default_sentence_idle_ms")]
    pub idle_ms: u64,
}

fn default_max_fragments() -> usize {
    10
}

fn default_sentence_idle_ms() -> u64 {
    2_000
}

impl Default for SentenceConfig {
    fn default() -> Self {
        Self {
            max_fragments: default_max_fragments(),
            idle_ms: default_sentence_idle_ms(),
        }
    }
}

/// Paragraph builder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParagraphConfig {
    /// Minimum paragraph duration before a silence gap may close it
    #[serde(default = "default_paragraph_min_ms")]
    pub min_ms: u64,

    /// Duration that force-closes a paragraph
    #[serde(default = "default_paragraph_max_ms")]
    pub max_ms: u64,

    /// Silence gap between sentences that closes a mature paragraph
    #[serde(default = "default_paragraph_silence_ms")]
    pub silence_ms: u64,
}

fn default_paragraph_min_ms() -> u64 {
    10_000
}

fn default_paragraph_max_ms() -> u64 {
    60_000
}

fn default_paragraph_silence_ms() -> u64 {
    2_000
}

impl Default for ParagraphConfig {
    fn default() -> Self {
        Self {
            min_ms: default_paragraph_min_ms(),
            max_ms: default_paragraph_max_ms(),
            silence_ms: default_paragraph_silence_ms(),
        }
    }
}

/// Stream coalescer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoalescerConfig {
    /// Quiet window after the last input before emission
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Hard cap from the first pending input to emission
    #[serde(default = "default_force_commit_ms")]
    pub force_commit_ms: u64,
}

fn default_debounce_ms() -> u64 {
    160
}

fn default_force_commit_ms() -> u64 {
    1_100
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            force_commit_ms: default_force_commit_ms(),
        }
    }
}

/// Display controller settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    /// Minimum time a segment stays visible
    #[serde(default = "default_min_show_ms")]
    pub min_show_ms: u64,

    #[serde(default = "default_fade_in_ms")]
    pub fade_in_ms: u64,

    #[serde(default = "default_fade_out_ms")]
    pub fade_out_ms: u64,

    /// Similarity at or above which a new text updates `recent` in place
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

fn default_min_show_ms() -> u64 {
    1_500
}

fn default_fade_in_ms() -> u64 {
    200
}

fn default_fade_out_ms() -> u64 {
    300
}

fn default_similarity_threshold() -> f32 {
    0.7
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            min_show_ms: default_min_show_ms(),
            fade_in_ms: default_fade_in_ms(),
            fade_out_ms: default_fade_out_ms(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Grace window for draining the translation queue on stop
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Interval of the periodic `stats` event
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_stats_interval_ms() -> u64 {
    5_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: default_stop_grace_ms(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

impl Settings {
    /// Load settings: defaults ← optional file ← `LECTERN_*` environment
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("LECTERN")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field invariants the serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.sample_rate == 0 || self.audio.frame_ms == 0 {
            return Err(ConfigError::Invalid(
                "audio.sample_rate and audio.frame_ms must be positive".into(),
            ));
        }
        if self.queue.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_concurrency must be at least 1".into(),
            ));
        }
        if self.paragraph.min_ms > self.paragraph.max_ms {
            return Err(ConfigError::Invalid(format!(
                "paragraph.min_ms ({}) exceeds paragraph.max_ms ({})",
                self.paragraph.min_ms, self.paragraph.max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.display.similarity_threshold) {
            return Err(ConfigError::Invalid(
                "display.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.coalescer.debounce_ms > self.coalescer.force_commit_ms {
            return Err(ConfigError::Invalid(format!(
                "coalescer.debounce_ms ({}) exceeds coalescer.force_commit_ms ({})",
                self.coalescer.debounce_ms, self.coalescer.force_commit_ms
            )));
        }
        if self.sentence.max_fragments == 0 {
            return Err(ConfigError::Invalid(
                "sentence.max_fragments must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.audio.sample_rate, 16_000);
        assert_eq!(settings.audio.frame_ms, 20);
        assert_eq!(settings.queue.max_concurrency, 3);
        assert_eq!(settings.queue.timeout_ms, 7_000);
        assert_eq!(settings.sentence.max_fragments, 10);
        assert_eq!(settings.sentence.idle_ms, 2_000);
        assert_eq!(settings.paragraph.min_ms, 10_000);
        assert_eq!(settings.paragraph.max_ms, 60_000);
        assert_eq!(settings.coalescer.debounce_ms, 160);
        assert_eq!(settings.coalescer.force_commit_ms, 1_100);
        assert_eq!(settings.display.min_show_ms, 1_500);
        assert!((settings.display.similarity_threshold - 0.7).abs() < 1e-6);
        assert_eq!(settings.pipeline.stop_grace_ms, 5_000);
        settings.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[asr]
model = "nova-3"
endpointing_ms = 500

[queue]
max_concurrency = 5
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.asr.model, "nova-3");
        assert_eq!(settings.asr.endpointing_ms, 500);
        assert_eq!(settings.queue.max_concurrency, 5);
        // Untouched sections keep defaults
        assert_eq!(settings.sentence.idle_ms, 2_000);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut settings = Settings::default();
        settings.asr.api_key = "secret".into();
        settings.queue.timeout_ms = 9_000;

        let serialized = toml::to_string(&settings).unwrap();
        let back: Settings = toml::from_str(&serialized).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_validation_rejects_inverted_paragraph_bounds() {
        let mut settings = Settings::default();
        settings.paragraph.min_ms = 90_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let mut settings = Settings::default();
        settings.queue.max_concurrency = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let mut settings = Settings::default();
        settings.display.similarity_threshold = 1.5;
        assert!(settings.validate().is_err());
    }
}
