//! Streaming recognizer session
//!
//! One session owns one WebSocket link to the recognizer. Audio frames are
//! forwarded as binary messages; JSON results come back as fragments. The
//! session task also runs the keep-alive schedule (the recognizer drops
//! idle links after ~10 s of silence) and the reconnection policy for
//! abnormal closes. Audio arriving while the link is down is buffered up to
//! a high-water mark; beyond it the oldest bytes are dropped in favor of
//! bounded memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    classify_close, listen_url, resolve_language, secs_to_ms, CloseClass, ServerMessage,
    CLOSE_STREAM_MESSAGE, KEEPALIVE_MESSAGE,
};
use lectern_config::{AsrConfig, AudioConfig};
use lectern_core::{
    AudioFrame, Error, ErrorCode, Language, RecognizerEvent, RecognizerStats, SpeechRecognizer,
    TranscriptFragment,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session-level knobs. Connection parameters come from [`AsrConfig`]; the
/// timings here implement the keep-alive and reconnection contracts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub asr: AsrConfig,
    pub audio: AudioConfig,
    pub source_language: Language,
    /// Idle window after which one zero-PCM frame is sent
    pub keepalive_idle: Duration,
    /// Interval of protocol keep-alive messages once idle
    pub keepalive_interval: Duration,
    /// Duration of the zero-PCM keep-alive frame
    pub zero_frame_ms: u32,
    /// First reconnect delay; doubles per attempt
    pub reconnect_initial: Duration,
    /// Backoff cap
    pub reconnect_cap: Duration,
    /// Reconnect attempts before the session fails
    pub reconnect_max_attempts: u32,
    /// Transmit-buffer high-water mark in bytes
    pub buffer_high_water: usize,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(asr: AsrConfig, audio: AudioConfig, source_language: Language) -> Self {
        Self {
            asr,
            audio,
            source_language,
            keepalive_idle: Duration::from_secs(9),
            keepalive_interval: Duration::from_secs(5),
            zero_frame_ms: 200,
            reconnect_initial: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            reconnect_max_attempts: 3,
            buffer_high_water: 2 * 1024 * 1024,
            event_capacity: 256,
        }
    }
}

/// Delay before reconnect attempt `n` (1-based): `initial * 2^(n-1)` capped,
/// plus up to 100 ms of jitter so parallel sessions do not thunder.
pub(crate) fn backoff_delay(attempt: u32, initial: Duration, cap: Duration) -> Duration {
    let exp = initial.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let base = exp.min(cap);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=100))
}

/// Byte-bounded FIFO of unsent audio chunks. `push` returns how many bytes
/// of oldest audio were evicted to stay under the high-water mark.
#[derive(Debug)]
pub(crate) struct SendBuffer {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    high_water: usize,
}

impl SendBuffer {
    pub fn new(high_water: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            high_water,
        }
    }

    pub fn push(&mut self, chunk: Vec<u8>) -> usize {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);

        let mut dropped = 0;
        while self.bytes > self.high_water {
            match self.chunks.pop_front() {
                Some(old) => {
                    self.bytes -= old.len();
                    dropped += old.len();
                }
                None => break,
            }
        }
        dropped
    }

    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.len();
        Some(chunk)
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Shared session counters. Instants are stored as millisecond offsets from
/// session creation so the struct stays lock-free.
#[derive(Debug)]
pub(crate) struct SessionMetrics {
    started: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnects: AtomicU64,
    connected_at_ms: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl SessionMetrics {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected_at_ms: AtomicU64::new(u64::MAX),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn offset_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn mark_connected(&self) {
        self.connected_at_ms.store(self.offset_ms(), Ordering::Relaxed);
        self.touch();
    }

    fn mark_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn mark_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn mark_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.last_activity_ms.store(self.offset_ms(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> RecognizerStats {
        let now = self.offset_ms();
        let connected_at = self.connected_at_ms.load(Ordering::Relaxed);
        RecognizerStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            uptime_ms: if connected_at == u64::MAX {
                0
            } else {
                now.saturating_sub(connected_at)
            },
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

enum SessionCommand {
    Audio(AudioFrame),
    Shutdown,
}

enum ConnectionOutcome {
    /// User/pipeline-initiated close
    Shutdown,
    /// Normal closure from the far end
    CloseNormal(Option<u16>, String),
    /// Terminal failure, no reconnect
    Terminal(ErrorCode, String),
    /// Abnormal close or transport error; retry with backoff
    Retry(String),
}

/// The recognizer session. Implements [`SpeechRecognizer`] so the
/// orchestrator (and tests) depend only on the trait.
pub struct AsrSession {
    config: SessionConfig,
    cmd_tx: Option<mpsc::Sender<SessionCommand>>,
    task: Option<JoinHandle<()>>,
    metrics: Arc<SessionMetrics>,
}

impl AsrSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            cmd_tx: None,
            task: None,
            metrics: Arc::new(SessionMetrics::new()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for AsrSession {
    async fn start_session(&mut self) -> lectern_core::Result<mpsc::Receiver<RecognizerEvent>> {
        if self.cmd_tx.is_some() {
            return Err(Error::Recognizer("session already started".into()));
        }

        // Fail fast on an unservable language before opening the socket
        let language = resolve_language(&self.config.asr.model, &self.config.source_language)
            .map_err(lectern_core::Error::from)?;
        let url = listen_url(&self.config.asr, &self.config.audio, &language);

        let (cmd_tx, cmd_rx) = mpsc::channel(512);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);

        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            run_session(config, url, cmd_rx, event_tx, metrics).await;
        });

        self.cmd_tx = Some(cmd_tx);
        self.task = Some(task);
        Ok(event_rx)
    }

    async fn send_audio(&mut self, frame: AudioFrame) -> lectern_core::Result<()> {
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or(Error::Recognizer("session not started".into()))?;
        tx.send(SessionCommand::Audio(frame))
            .await
            .map_err(|_| Error::ChannelClosed("recognizer session"))
    }

    async fn stop_session(&mut self) -> lectern_core::Result<()> {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(SessionCommand::Shutdown).await;
        }
        if let Some(task) = self.task.take() {
            // The task closes the socket promptly; abort if it does not
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_millis(250), task)
                .await
                .is_err()
            {
                tracing::warn!("Recognizer session did not shut down in time, aborting");
                abort.abort();
            }
        }
        Ok(())
    }

    fn stats(&self) -> RecognizerStats {
        self.metrics.snapshot()
    }
}

async fn connect(config: &SessionConfig, url: &str) -> Result<WsStream, ConnectionOutcome> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectionOutcome::Terminal(ErrorCode::AsrBadRequest, e.to_string()))?;
    let auth = format!("Token {}", config.asr.api_key);
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&auth)
            .map_err(|e| ConnectionOutcome::Terminal(ErrorCode::AsrBadRequest, e.to_string()))?,
    );

    match connect_async(request).await {
        Ok((ws, _)) => Ok(ws),
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            let status = response.status();
            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ConnectionOutcome::Terminal(
                    ErrorCode::AsrUnauthorized,
                    format!("handshake rejected: {}", status),
                )),
                StatusCode::BAD_REQUEST => Err(ConnectionOutcome::Terminal(
                    ErrorCode::AsrBadRequest,
                    format!("handshake rejected: {}", status),
                )),
                _ => Err(ConnectionOutcome::Retry(format!(
                    "handshake failed: {}",
                    status
                ))),
            }
        }
        Err(e) => Err(ConnectionOutcome::Retry(e.to_string())),
    }
}

async fn run_session(
    config: SessionConfig,
    url: String,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<RecognizerEvent>,
    metrics: Arc<SessionMetrics>,
) {
    let mut buffer = SendBuffer::new(config.buffer_high_water);
    let mut attempt: u32 = 0;
    let mut pending_retry = false;

    loop {
        if pending_retry {
            attempt += 1;
            if attempt > config.reconnect_max_attempts {
                tracing::error!(attempts = attempt - 1, "Recognizer reconnection exhausted");
                let _ = event_tx
                    .send(RecognizerEvent::Fatal {
                        code: ErrorCode::AsrReconnectionFailed,
                        message: format!(
                            "reconnection failed after {} attempts",
                            config.reconnect_max_attempts
                        ),
                    })
                    .await;
                return;
            }

            let delay = backoff_delay(attempt, config.reconnect_initial, config.reconnect_cap);
            metrics.mark_reconnect();
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to recognizer");
            let _ = event_tx
                .send(RecognizerEvent::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                })
                .await;

            if !wait_backoff(delay, &mut cmd_rx, &mut buffer, &event_tx).await {
                return;
            }
        }

        match connect(&config, &url).await {
            Ok(ws) => {
                attempt = 0;
                pending_retry = false;
                metrics.mark_connected();
                tracing::info!(model = %config.asr.model, "Recognizer connected");
                if event_tx.send(RecognizerEvent::Connected).await.is_err() {
                    return;
                }

                match drive_connection(&config, ws, &mut cmd_rx, &mut buffer, &event_tx, &metrics)
                    .await
                {
                    ConnectionOutcome::Shutdown => {
                        let _ = event_tx
                            .send(RecognizerEvent::Disconnected {
                                code: Some(1000),
                                reason: "session closed".into(),
                            })
                            .await;
                        return;
                    }
                    ConnectionOutcome::CloseNormal(code, reason) => {
                        let _ = event_tx
                            .send(RecognizerEvent::Disconnected { code, reason })
                            .await;
                        return;
                    }
                    ConnectionOutcome::Terminal(code, message) => {
                        let _ = event_tx.send(RecognizerEvent::Fatal { code, message }).await;
                        return;
                    }
                    ConnectionOutcome::Retry(reason) => {
                        tracing::warn!(reason = %reason, "Recognizer connection lost");
                        let _ = event_tx
                            .send(RecognizerEvent::Disconnected { code: None, reason })
                            .await;
                        pending_retry = true;
                    }
                }
            }
            Err(ConnectionOutcome::Terminal(code, message)) => {
                let _ = event_tx.send(RecognizerEvent::Fatal { code, message }).await;
                return;
            }
            Err(ConnectionOutcome::Retry(reason)) => {
                tracing::warn!(reason = %reason, "Recognizer connect failed");
                pending_retry = true;
            }
            Err(_) => unreachable!("connect returns Terminal or Retry"),
        }
    }
}

/// Sleep out the backoff while still admitting (and buffering) audio.
/// Returns `false` when the session was shut down during the wait.
async fn wait_backoff(
    delay: Duration,
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    buffer: &mut SendBuffer,
    event_tx: &mpsc::Sender<RecognizerEvent>,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Audio(frame)) => {
                    let dropped = buffer.push(frame.data);
                    if dropped > 0 {
                        let _ = event_tx
                            .send(RecognizerEvent::BufferOverflow { dropped_bytes: dropped })
                            .await;
                    }
                }
                Some(SessionCommand::Shutdown) | None => return false,
            },
        }
    }
}

async fn drive_connection(
    config: &SessionConfig,
    ws: WsStream,
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    buffer: &mut SendBuffer,
    event_tx: &mpsc::Sender<RecognizerEvent>,
    metrics: &SessionMetrics,
) -> ConnectionOutcome {
    let (mut sink, mut stream) = ws.split();

    // Replay audio buffered while the link was down
    while let Some(chunk) = buffer.pop_front() {
        let len = chunk.len();
        if let Err(e) = sink.send(Message::Binary(chunk)).await {
            return ConnectionOutcome::Retry(format!("replay send failed: {}", e));
        }
        metrics.mark_sent(len);
    }

    let mut last_audio = Instant::now();
    let mut last_keepalive = Instant::now();
    let mut zero_frame_sent = false;

    let mut keepalive_tick = tokio::time::interval(Duration::from_millis(500));
    keepalive_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Audio(frame)) => {
                    let len = frame.data.len();
                    if let Err(e) = sink.send(Message::Binary(frame.data)).await {
                        return ConnectionOutcome::Retry(format!("audio send failed: {}", e));
                    }
                    metrics.mark_sent(len);
                    last_audio = Instant::now();
                    zero_frame_sent = false;
                }
                Some(SessionCommand::Shutdown) | None => {
                    let _ = sink.send(Message::Text(CLOSE_STREAM_MESSAGE.into())).await;
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionOutcome::Shutdown;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    metrics.mark_received(text.len());
                    for event in parse_events(config, &text) {
                        if event_tx.send(event).await.is_err() {
                            return ConnectionOutcome::Shutdown;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    return match classify_close(code) {
                        CloseClass::Normal => ConnectionOutcome::CloseNormal(code, reason),
                        CloseClass::BadRequest => ConnectionOutcome::Terminal(
                            ErrorCode::AsrBadRequest,
                            format!("close {}: {}", code.unwrap_or(0), reason),
                        ),
                        CloseClass::Unauthorized => ConnectionOutcome::Terminal(
                            ErrorCode::AsrUnauthorized,
                            format!("close {}: {}", code.unwrap_or(0), reason),
                        ),
                        CloseClass::Recoverable => ConnectionOutcome::Retry(format!(
                            "abnormal close {}: {}",
                            code.unwrap_or(1006),
                            reason
                        )),
                    };
                }
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(e)) => return ConnectionOutcome::Retry(e.to_string()),
                None => return ConnectionOutcome::Retry("stream ended".into()),
            },

            _ = keepalive_tick.tick() => {
                if !zero_frame_sent && last_audio.elapsed() >= config.keepalive_idle {
                    let frame = AudioFrame::silence(config.zero_frame_ms, config.audio.sample_rate);
                    let len = frame.data.len();
                    if let Err(e) = sink.send(Message::Binary(frame.data)).await {
                        return ConnectionOutcome::Retry(format!("keepalive send failed: {}", e));
                    }
                    metrics.mark_sent(len);
                    zero_frame_sent = true;
                    last_keepalive = Instant::now();
                    tracing::debug!("Sent zero-PCM keep-alive frame");
                } else if zero_frame_sent && last_keepalive.elapsed() >= config.keepalive_interval {
                    if let Err(e) = sink.send(Message::Text(KEEPALIVE_MESSAGE.into())).await {
                        return ConnectionOutcome::Retry(format!("keepalive send failed: {}", e));
                    }
                    metrics.mark_sent(KEEPALIVE_MESSAGE.len());
                    last_keepalive = Instant::now();
                    tracing::debug!("Sent protocol keep-alive");
                }
            }
        }
    }
}

/// Translate one server message into recognizer events
fn parse_events(config: &SessionConfig, text: &str) -> Vec<RecognizerEvent> {
    let Some(message) = ServerMessage::parse(text) else {
        return Vec::new();
    };

    match message {
        ServerMessage::Results {
            channel,
            is_final,
            start,
            duration,
            end,
        } => {
            let Some(alt) = channel.alternatives.first() else {
                return Vec::new();
            };
            if alt.transcript.trim().is_empty() {
                return Vec::new();
            }

            let start_ms = start.map(secs_to_ms).unwrap_or(0);
            let end_ms = end
                .map(secs_to_ms)
                .or_else(|| {
                    start.map(|s| secs_to_ms(s + duration.unwrap_or(0.0)))
                })
                .unwrap_or(start_ms);

            let fragment = TranscriptFragment::new(
                alt.transcript.clone(),
                alt.confidence.unwrap_or(0.0),
                is_final.unwrap_or(false),
                start_ms,
                end_ms,
                config.source_language.clone(),
            );
            vec![RecognizerEvent::Fragment(fragment)]
        }
        ServerMessage::UtteranceEnd { last_word_end } => vec![RecognizerEvent::UtteranceEnd {
            last_word_end_ms: last_word_end.map(secs_to_ms),
        }],
        ServerMessage::Error { error, description } => {
            let message = description
                .or(error)
                .unwrap_or_else(|| "unspecified recognizer error".into());
            tracing::warn!(message = %message, "Recognizer reported an error");
            vec![RecognizerEvent::ProviderError { message }]
        }
        ServerMessage::Metadata {} | ServerMessage::SpeechStarted {} => Vec::new(),
    }
}
