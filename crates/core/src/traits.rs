//! Narrow capability traits at the component seams
//!
//! Components never hold references to each other; the orchestrator wires
//! them through these traits plus channels, so the recognizer and the
//! translation backend can be swapped for stubs in tests or for alternate
//! providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::AudioFrame;
use crate::error::{ErrorCode, Result};
use crate::transcript::TranscriptFragment;

/// Events surfaced by a speech recognizer session
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    /// Connection established (initial or after reconnect)
    Connected,
    /// A transcript fragment, interim or final
    Fragment(TranscriptFragment),
    /// Provider hint that the speaker paused; never carries a fragment
    UtteranceEnd { last_word_end_ms: Option<u64> },
    /// Automatic reconnection in progress
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Connection closed (normal or pipeline-initiated)
    Disconnected {
        code: Option<u16>,
        reason: String,
    },
    /// Oldest unsent audio dropped at the buffer high-water mark
    BufferOverflow { dropped_bytes: usize },
    /// Non-fatal error message from the provider
    ProviderError { message: String },
    /// Unrecoverable failure; the session is terminal
    Fatal { code: ErrorCode, message: String },
}

/// Recognizer session counters, emitted on the `stats` event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizerStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub uptime_ms: u64,
    pub last_activity_ms: u64,
    pub reconnects: u64,
}

/// A streaming speech recognizer session.
///
/// `start_session` hands back the event receiver; exactly one session is
/// live per recognizer instance. Audio pushed while the link is down is
/// buffered up to the implementation's high-water mark.
#[async_trait]
pub trait SpeechRecognizer: Send {
    async fn start_session(&mut self) -> Result<mpsc::Receiver<RecognizerEvent>>;

    async fn send_audio(&mut self, frame: AudioFrame) -> Result<()>;

    async fn stop_session(&mut self) -> Result<()>;

    fn stats(&self) -> RecognizerStats;
}
