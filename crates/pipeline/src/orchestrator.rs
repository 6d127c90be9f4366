//! Pipeline orchestrator
//!
//! Owns the lifecycle state and the live component set. All wiring runs
//! through channels: the recognizer feeds fragments to the bus, the display
//! path, and the sentence combiner; sentences feed the paragraph builder
//! and the realtime translation path; paragraphs feed the high-quality
//! retranslation path; translation results feed the bus and the display.
//! No component holds a reference to another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use lectern_asr::AsrSession;
use lectern_config::Settings;
use lectern_core::{
    AudioFrame, Command, CommandResponse, ErrorCode, ErrorPayload, FinalReportPayload, Language,
    Paragraph, PipelineEvent, PipelineState, Priority, QualityTier, RecognizerEvent, Sentence,
    SpeechRecognizer, StartCommand, StatsPayload, StatusPayload, SummaryPayload, TranscriptFragment,
    TranslateUserText, TranslationDelta, TranslationRequest, VocabularyPayload,
};
use lectern_translate::{
    HttpBackend, QueueEvent, QueueSettings, TranslationBackend, TranslationQueue, Translator,
};

use crate::bus::{BusSubscriber, EventBus};
use crate::coalescer::{CoalescerInput, StreamCoalescer};
use crate::display::DisplayController;
use crate::paragraph::ParagraphBuilder;
use crate::registry::SegmentRegistry;
use crate::sentence::SentenceCombiner;

/// Creates recognizer sessions; swap for a stub in tests
pub trait RecognizerFactory: Send + Sync {
    fn create(
        &self,
        settings: &Settings,
        source_language: &Language,
    ) -> lectern_core::Result<Box<dyn SpeechRecognizer>>;
}

struct DefaultRecognizerFactory;

impl RecognizerFactory for DefaultRecognizerFactory {
    fn create(
        &self,
        settings: &Settings,
        source_language: &Language,
    ) -> lectern_core::Result<Box<dyn SpeechRecognizer>> {
        Ok(Box::new(AsrSession::new(lectern_asr::SessionConfig::new(
            settings.asr.clone(),
            settings.audio.clone(),
            source_language.clone(),
        ))))
    }
}

#[derive(Default)]
struct SessionCounters {
    sentences: AtomicU64,
    paragraphs: AtomicU64,
    words: AtomicU64,
}

enum CombinerMsg {
    Fragment(TranscriptFragment),
    /// Utterance-end hint: close the accumulator early
    Hint,
}

enum DisplayMsg {
    Source {
        unit_id: String,
        text: String,
        is_final: bool,
    },
    Translation {
        unit_id: String,
        target_text: String,
    },
}

/// Shared context for the stage tasks
struct StageCtx {
    bus: EventBus,
    correlation_id: String,
    source_language: Language,
    target_language: Language,
    registry: Arc<SegmentRegistry>,
    counters: Arc<SessionCounters>,
    queue: Arc<TranslationQueue>,
    display_tx: mpsc::Sender<DisplayMsg>,
    state_rx: watch::Receiver<PipelineState>,
}

impl StageCtx {
    /// After a non-recoverable error nothing downstream may emit
    fn silenced(&self) -> bool {
        *self.state_rx.borrow() == PipelineState::Error
    }
}

struct SessionRuntime {
    session_id: String,
    correlation_id: String,
    settings: Settings,
    source_language: Language,
    target_language: Language,
    started_at: Instant,
    audio_tx: mpsc::Sender<AudioFrame>,
    display_tx: mpsc::Sender<DisplayMsg>,
    queue: Arc<TranslationQueue>,
    recognizer: Arc<AsyncMutex<Box<dyn SpeechRecognizer>>>,
    registry: Arc<SegmentRegistry>,
    counters: Arc<SessionCounters>,
    coalescer: Arc<StreamCoalescer>,
    request_correlations: Arc<DashMap<String, String>>,
    recognizer_task: JoinHandle<()>,
    combiner_task: JoinHandle<()>,
    paragraph_task: JoinHandle<()>,
    display_task: JoinHandle<()>,
    queue_task: JoinHandle<()>,
    forwarder_task: JoinHandle<()>,
    audio_task: JoinHandle<()>,
    stats_task: JoinHandle<()>,
}

/// The pipeline orchestrator (C10). One instance serves one session at a
/// time; `handle` drives the lifecycle.
pub struct Pipeline {
    settings: Settings,
    bus: EventBus,
    state_tx: Arc<watch::Sender<PipelineState>>,
    recognizer_factory: Arc<dyn RecognizerFactory>,
    backend_override: Option<Arc<dyn TranslationBackend>>,
    session: Option<SessionRuntime>,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Idle);
        Self {
            settings,
            bus: EventBus::new(),
            state_tx: Arc::new(state_tx),
            recognizer_factory: Arc::new(DefaultRecognizerFactory),
            backend_override: None,
            session: None,
        }
    }

    /// Swap the recognizer implementation (tests, alternate providers)
    pub fn with_recognizer_factory(mut self, factory: Arc<dyn RecognizerFactory>) -> Self {
        self.recognizer_factory = factory;
        self
    }

    /// Swap the translation backend (tests, alternate providers)
    pub fn with_translation_backend(mut self, backend: Arc<dyn TranslationBackend>) -> Self {
        self.backend_override = Some(backend);
        self
    }

    pub fn subscribe(&self) -> BusSubscriber {
        self.bus.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state_tx.borrow()
    }

    /// Audio entry point for the capture collaborator; `None` when idle
    pub fn audio_sender(&self) -> Option<mpsc::Sender<AudioFrame>> {
        self.session.as_ref().map(|s| s.audio_tx.clone())
    }

    /// Publish a progressive summary on behalf of the summary collaborator
    pub fn publish_summary(&self, summary: SummaryPayload) {
        let correlation = self.session.as_ref().map(|s| s.correlation_id.clone());
        self.bus.publish(PipelineEvent::Summary(summary), correlation);
    }

    /// Publish a vocabulary update on behalf of its collaborator
    pub fn publish_vocabulary(&self, vocabulary: VocabularyPayload) {
        let correlation = self.session.as_ref().map(|s| s.correlation_id.clone());
        self.bus
            .publish(PipelineEvent::Vocabulary(vocabulary), correlation);
    }

    /// Execute one command
    pub async fn handle(&mut self, command: Command) -> CommandResponse {
        match command {
            Command::Start(cmd) => self.start(cmd).await,
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop().await,
            Command::TranslateUserText(cmd) => self.translate_user_text(cmd),
        }
    }

    async fn start(&mut self, mut cmd: StartCommand) -> CommandResponse {
        let correlation = cmd.correlation_id.clone();
        if !self.transition(PipelineState::Starting, Some(&correlation)) {
            return CommandResponse::fail(format!(
                "cannot start from state {}",
                self.state().as_str()
            ));
        }

        // Per-session settings override from the command, if any
        let settings = match cmd.config.take() {
            Some(value) => match serde_json::from_value::<Settings>(value) {
                Ok(settings) => match settings.validate() {
                    Ok(()) => settings,
                    Err(e) => {
                        return self.fail_start(ErrorCode::Internal, e.to_string(), &correlation)
                    }
                },
                Err(e) => {
                    return self.fail_start(
                        ErrorCode::Internal,
                        format!("invalid session config: {}", e),
                        &correlation,
                    )
                }
            },
            None => self.settings.clone(),
        };

        // Translation stack
        let backend: Arc<dyn TranslationBackend> = match &self.backend_override {
            Some(backend) => backend.clone(),
            None => match HttpBackend::new(settings.translator.clone()) {
                Ok(backend) => Arc::new(backend),
                Err(e) => return self.fail_start(ErrorCode::Internal, e.to_string(), &correlation),
            },
        };
        let translator = Translator::new(backend)
            .with_max_output_tokens(settings.translator.max_output_tokens)
            .with_temperature(settings.translator.temperature);
        let (queue, queue_rx) =
            TranslationQueue::new(translator, QueueSettings::from(&settings.queue));
        let queue = Arc::new(queue);

        // Recognizer session
        let mut recognizer = match self
            .recognizer_factory
            .create(&settings, &cmd.source_language)
        {
            Ok(recognizer) => recognizer,
            Err(e) => {
                queue.shutdown();
                let code = error_code_for(&e);
                return self.fail_start(code, e.to_string(), &correlation);
            }
        };
        let recognizer_events = match recognizer.start_session().await {
            Ok(events) => events,
            Err(e) => {
                queue.shutdown();
                let code = error_code_for(&e);
                return self.fail_start(code, e.to_string(), &correlation);
            }
        };
        let recognizer = Arc::new(AsyncMutex::new(recognizer));

        // Wiring
        let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(512);
        let (combiner_tx, combiner_rx) = mpsc::channel::<CombinerMsg>(256);
        let (sentence_tx, sentence_rx) = mpsc::channel::<Sentence>(64);
        let (display_tx, display_rx) = mpsc::channel::<DisplayMsg>(256);
        let (coalescer, coalesced_rx) = StreamCoalescer::new(settings.coalescer.clone());
        let coalescer = Arc::new(coalescer);

        let registry = Arc::new(SegmentRegistry::new());
        let counters = Arc::new(SessionCounters::default());
        let request_correlations = Arc::new(DashMap::new());

        let ctx = Arc::new(StageCtx {
            bus: self.bus.clone(),
            correlation_id: correlation.clone(),
            source_language: cmd.source_language.clone(),
            target_language: cmd.target_language.clone(),
            registry: registry.clone(),
            counters: counters.clone(),
            queue: queue.clone(),
            display_tx: display_tx.clone(),
            state_rx: self.state_tx.subscribe(),
        });

        let forwarder_task = tokio::spawn(forward_coalesced(coalesced_rx, self.bus.clone()));
        let recognizer_task = tokio::spawn(recognizer_loop(
            recognizer_events,
            self.bus.clone(),
            self.state_tx.clone(),
            combiner_tx,
            display_tx.clone(),
            queue.clone(),
            correlation.clone(),
        ));
        let combiner_task = tokio::spawn(combiner_loop(
            SentenceCombiner::new(settings.sentence.clone()),
            combiner_rx,
            sentence_tx,
            ctx.clone(),
        ));
        let paragraph_task = tokio::spawn(paragraph_loop(
            ParagraphBuilder::new(settings.paragraph.clone()),
            sentence_rx,
            ctx.clone(),
        ));
        let display_task = tokio::spawn(display_loop(
            DisplayController::new(settings.display.clone()),
            display_rx,
            coalescer.clone(),
            correlation.clone(),
        ));
        let queue_task = tokio::spawn(queue_loop(
            queue_rx,
            ctx.clone(),
            coalescer.clone(),
            request_correlations.clone(),
        ));
        let audio_task = tokio::spawn(audio_pump(
            audio_rx,
            recognizer.clone(),
            self.state_tx.subscribe(),
        ));
        let stats_task = tokio::spawn(stats_loop(
            recognizer.clone(),
            queue.clone(),
            self.bus.clone(),
            self.state_tx.subscribe(),
            Duration::from_millis(settings.pipeline.stats_interval_ms),
            correlation.clone(),
        ));

        self.session = Some(SessionRuntime {
            session_id: cmd.session_id,
            correlation_id: correlation,
            settings,
            source_language: cmd.source_language,
            target_language: cmd.target_language,
            started_at: Instant::now(),
            audio_tx,
            display_tx,
            queue,
            recognizer,
            registry,
            counters,
            coalescer,
            request_correlations,
            recognizer_task,
            combiner_task,
            paragraph_task,
            display_task,
            queue_task,
            forwarder_task,
            audio_task,
            stats_task,
        });

        CommandResponse::ok()
    }

    fn pause(&mut self) -> CommandResponse {
        if self.transition(PipelineState::Paused, self.correlation().as_deref()) {
            CommandResponse::ok()
        } else {
            CommandResponse::fail(format!("cannot pause from state {}", self.state().as_str()))
        }
    }

    fn resume(&mut self) -> CommandResponse {
        if self.state() != PipelineState::Paused {
            return CommandResponse::fail(format!(
                "cannot resume from state {}",
                self.state().as_str()
            ));
        }
        if self.transition(PipelineState::Listening, self.correlation().as_deref()) {
            CommandResponse::ok()
        } else {
            CommandResponse::fail("resume rejected".to_string())
        }
    }

    async fn stop(&mut self) -> CommandResponse {
        let state = self.state();

        if state == PipelineState::Error {
            // Explicit stop is the only exit from the error state
            if let Some(runtime) = self.session.take() {
                teardown_failed_session(runtime).await;
            }
            self.transition(PipelineState::Idle, None);
            return CommandResponse::ok();
        }

        if !state.can_transition(PipelineState::Stopping) {
            return CommandResponse::fail(format!(
                "cannot stop from state {}",
                self.state().as_str()
            ));
        }

        let Some(runtime) = self.session.take() else {
            return CommandResponse::fail("no active session".to_string());
        };
        let correlation = runtime.correlation_id.clone();
        self.transition(PipelineState::Stopping, Some(&correlation));

        // Closing the recognizer ends its event stream, which cascades:
        // the combiner flushes its last sentence, then the paragraph
        // builder flushes, then both stages enqueue their translations.
        {
            let mut recognizer = runtime.recognizer.lock().await;
            if let Err(e) = recognizer.stop_session().await {
                tracing::warn!(error = %e, "Recognizer stop reported an error");
            }
        }
        let settle = Duration::from_secs(1);
        let _ = tokio::time::timeout(settle, runtime.recognizer_task).await;
        let _ = tokio::time::timeout(settle, runtime.combiner_task).await;
        let _ = tokio::time::timeout(settle, runtime.paragraph_task).await;

        // Drain in-flight translations within the grace window
        let grace = Duration::from_millis(runtime.settings.pipeline.stop_grace_ms);
        if !runtime.queue.drain(grace).await {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "Stop grace expired, cancelling remaining translations");
        }
        runtime.queue.shutdown();
        let _ = tokio::time::timeout(settle, runtime.queue_task).await;

        // Let the display path settle, then flush coalesced updates
        drop(runtime.display_tx);
        let _ = tokio::time::timeout(settle, runtime.display_task).await;
        runtime.coalescer.flush_all().await;
        drop(runtime.coalescer);
        let _ = tokio::time::timeout(settle, runtime.forwarder_task).await;

        runtime.audio_task.abort();
        runtime.stats_task.abort();

        self.bus.publish(
            PipelineEvent::FinalReport(FinalReportPayload {
                session_id: runtime.session_id.clone(),
                duration_ms: runtime.started_at.elapsed().as_millis() as u64,
                sentence_count: runtime.counters.sentences.load(Ordering::Relaxed),
                paragraph_count: runtime.counters.paragraphs.load(Ordering::Relaxed),
                word_count: runtime.counters.words.load(Ordering::Relaxed),
                source_language: runtime.source_language.clone(),
                target_language: runtime.target_language.clone(),
            }),
            Some(correlation.clone()),
        );

        runtime.registry.clear();
        self.transition(PipelineState::Idle, Some(&correlation));
        CommandResponse::ok()
    }

    fn translate_user_text(&mut self, cmd: TranslateUserText) -> CommandResponse {
        let state = self.state();
        let Some(runtime) = &self.session else {
            return CommandResponse::fail("no active session".to_string());
        };
        if !matches!(state, PipelineState::Listening | PipelineState::Paused) {
            return CommandResponse::fail(format!(
                "cannot translate user text in state {}",
                state.as_str()
            ));
        }

        let request_id = format!("user:{}", cmd.correlation_id);
        runtime
            .request_correlations
            .insert(request_id.clone(), cmd.correlation_id.clone());
        runtime.queue.enqueue(TranslationRequest::new(
            request_id.clone(),
            request_id,
            cmd.text,
            cmd.source_language,
            cmd.target_language,
            Priority::High,
            QualityTier::Realtime,
        ));
        CommandResponse::ok()
    }

    fn correlation(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.correlation_id.clone())
    }

    fn transition(&self, to: PipelineState, correlation: Option<&str>) -> bool {
        transition(
            &self.bus,
            &self.state_tx,
            to,
            correlation.map(|s| s.to_string()),
        )
    }

    fn fail_start(
        &mut self,
        code: ErrorCode,
        message: String,
        correlation: &str,
    ) -> CommandResponse {
        tracing::error!(code = ?code, message = %message, "Session start failed");
        self.bus.publish(
            PipelineEvent::Error(ErrorPayload::new(code, message.clone()).fatal()),
            Some(correlation.to_string()),
        );
        self.state_tx.send_replace(PipelineState::Error);
        self.bus.publish(
            PipelineEvent::Status(StatusPayload::State {
                state: PipelineState::Error,
            }),
            Some(correlation.to_string()),
        );
        CommandResponse::fail(message)
    }
}

/// Validate and apply a state transition, emitting the status event.
/// Illegal transitions emit an `INVALID_STATE_TRANSITION` error instead.
fn transition(
    bus: &EventBus,
    state_tx: &watch::Sender<PipelineState>,
    to: PipelineState,
    correlation: Option<String>,
) -> bool {
    let from = *state_tx.borrow();
    if !from.can_transition(to) {
        bus.publish(
            PipelineEvent::Error(ErrorPayload::new(
                ErrorCode::InvalidStateTransition,
                format!("{} -> {}", from.as_str(), to.as_str()),
            )),
            correlation,
        );
        return false;
    }
    state_tx.send_replace(to);
    tracing::info!(from = from.as_str(), to = to.as_str(), "Pipeline state change");
    bus.publish(
        PipelineEvent::Status(StatusPayload::State { state: to }),
        correlation,
    );
    true
}

fn error_code_for(error: &lectern_core::Error) -> ErrorCode {
    match error {
        lectern_core::Error::UnsupportedLanguage { .. } => ErrorCode::AsrUnsupportedLanguage,
        lectern_core::Error::Recognizer(_) => ErrorCode::AsrConnectionLost,
        _ => ErrorCode::Internal,
    }
}

/// Tear down a session that died on a fatal error: everything is already
/// winding down, just make sure nothing lingers.
async fn teardown_failed_session(runtime: SessionRuntime) {
    runtime.queue.shutdown();
    {
        let mut recognizer = runtime.recognizer.lock().await;
        let _ = recognizer.stop_session().await;
    }
    for task in [
        runtime.recognizer_task,
        runtime.combiner_task,
        runtime.paragraph_task,
        runtime.display_task,
        runtime.queue_task,
        runtime.forwarder_task,
        runtime.audio_task,
        runtime.stats_task,
    ] {
        task.abort();
    }
    runtime.registry.clear();
}

async fn forward_coalesced(
    mut rx: mpsc::Receiver<(PipelineEvent, Option<String>)>,
    bus: EventBus,
) {
    while let Some((event, correlation)) = rx.recv().await {
        bus.publish(event, correlation);
    }
}

#[allow(clippy::too_many_arguments)]
async fn recognizer_loop(
    mut events: mpsc::Receiver<RecognizerEvent>,
    bus: EventBus,
    state_tx: Arc<watch::Sender<PipelineState>>,
    combiner_tx: mpsc::Sender<CombinerMsg>,
    display_tx: mpsc::Sender<DisplayMsg>,
    queue: Arc<TranslationQueue>,
    correlation: String,
) {
    while let Some(event) = events.recv().await {
        match event {
            RecognizerEvent::Connected => {
                if *state_tx.borrow() == PipelineState::Starting {
                    transition(
                        &bus,
                        &state_tx,
                        PipelineState::Listening,
                        Some(correlation.clone()),
                    );
                } else {
                    bus.publish(
                        PipelineEvent::Status(StatusPayload::Connection {
                            connected: true,
                            detail: None,
                        }),
                        Some(correlation.clone()),
                    );
                }
            }
            RecognizerEvent::Fragment(fragment) => {
                bus.publish(
                    PipelineEvent::Fragment(fragment.clone()),
                    Some(correlation.clone()),
                );
                if fragment.is_final {
                    if combiner_tx
                        .send(CombinerMsg::Fragment(fragment))
                        .await
                        .is_err()
                    {
                        break;
                    }
                } else {
                    let _ = display_tx
                        .send(DisplayMsg::Source {
                            unit_id: fragment.id.clone(),
                            text: fragment.text.clone(),
                            is_final: false,
                        })
                        .await;
                }
            }
            RecognizerEvent::UtteranceEnd { last_word_end_ms } => {
                bus.publish(
                    PipelineEvent::Status(StatusPayload::UtteranceEnd { last_word_end_ms }),
                    Some(correlation.clone()),
                );
                let _ = combiner_tx.send(CombinerMsg::Hint).await;
            }
            RecognizerEvent::Reconnecting { attempt, delay_ms } => {
                bus.publish(
                    PipelineEvent::Status(StatusPayload::Connection {
                        connected: false,
                        detail: Some(format!(
                            "reconnecting, attempt {} in {} ms",
                            attempt, delay_ms
                        )),
                    }),
                    Some(correlation.clone()),
                );
            }
            RecognizerEvent::Disconnected { code, reason } => {
                bus.publish(
                    PipelineEvent::Status(StatusPayload::Connection {
                        connected: false,
                        detail: Some(match code {
                            Some(code) => format!("closed ({}): {}", code, reason),
                            None => format!("closed: {}", reason),
                        }),
                    }),
                    Some(correlation.clone()),
                );
            }
            RecognizerEvent::BufferOverflow { dropped_bytes } => {
                bus.publish(
                    PipelineEvent::Error(
                        ErrorPayload::new(
                            ErrorCode::AudioBackpressureDrop,
                            format!("dropped {} oldest unsent audio bytes", dropped_bytes),
                        )
                        .with_context(serde_json::json!({ "dropped_bytes": dropped_bytes })),
                    ),
                    Some(correlation.clone()),
                );
            }
            RecognizerEvent::ProviderError { message } => {
                bus.publish(
                    PipelineEvent::Error(ErrorPayload::new(ErrorCode::Internal, message)),
                    Some(correlation.clone()),
                );
            }
            RecognizerEvent::Fatal { code, message } => {
                bus.publish(
                    PipelineEvent::Error(ErrorPayload::new(code, message).fatal()),
                    Some(correlation.clone()),
                );
                state_tx.send_replace(PipelineState::Error);
                bus.publish(
                    PipelineEvent::Status(StatusPayload::State {
                        state: PipelineState::Error,
                    }),
                    Some(correlation.clone()),
                );
                // No further transcript or translation output after a
                // non-recoverable failure
                queue.cancel_all();
                break;
            }
        }
    }
    // Dropping combiner_tx flushes the sentence accumulator downstream
}

async fn emit_sentence(ctx: &StageCtx, sentence_tx: &mpsc::Sender<Sentence>, sentence: Sentence) {
    if ctx.silenced() {
        return;
    }
    for fragment_id in &sentence.fragment_ids {
        ctx.registry.bind(fragment_id.clone(), sentence.id.clone());
    }
    ctx.counters.sentences.fetch_add(1, Ordering::Relaxed);

    ctx.bus.publish(
        PipelineEvent::Sentence(sentence.clone()),
        Some(ctx.correlation_id.clone()),
    );
    let _ = ctx
        .display_tx
        .send(DisplayMsg::Source {
            unit_id: sentence.id.clone(),
            text: sentence.source_text.clone(),
            is_final: true,
        })
        .await;

    ctx.queue.enqueue(TranslationRequest::new(
        format!("sentence:{}:realtime", sentence.id),
        sentence.id.clone(),
        sentence.source_text.clone(),
        ctx.source_language.clone(),
        ctx.target_language.clone(),
        Priority::Normal,
        QualityTier::Realtime,
    ));

    let _ = sentence_tx.send(sentence).await;
}

async fn combiner_loop(
    mut combiner: SentenceCombiner,
    mut rx: mpsc::Receiver<CombinerMsg>,
    sentence_tx: mpsc::Sender<Sentence>,
    ctx: Arc<StageCtx>,
) {
    loop {
        let deadline = combiner.idle_deadline();
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(CombinerMsg::Fragment(fragment)) => {
                    if let Some(sentence) = combiner.push(fragment) {
                        emit_sentence(&ctx, &sentence_tx, sentence).await;
                    }
                }
                Some(CombinerMsg::Hint) => {
                    if let Some(sentence) = combiner.flush() {
                        emit_sentence(&ctx, &sentence_tx, sentence).await;
                    }
                }
                None => {
                    if let Some(sentence) = combiner.flush() {
                        emit_sentence(&ctx, &sentence_tx, sentence).await;
                    }
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                if let Some(sentence) = combiner.flush() {
                    emit_sentence(&ctx, &sentence_tx, sentence).await;
                }
            }
        }
    }
}

async fn emit_paragraph(ctx: &StageCtx, paragraph: Paragraph) {
    if ctx.silenced() {
        return;
    }
    for sentence_id in &paragraph.sentence_ids {
        ctx.registry.bind(sentence_id.clone(), paragraph.id.clone());
    }
    ctx.counters.paragraphs.fetch_add(1, Ordering::Relaxed);
    ctx.counters
        .words
        .fetch_add(paragraph.word_count as u64, Ordering::Relaxed);

    ctx.bus.publish(
        PipelineEvent::Paragraph(paragraph.clone()),
        Some(ctx.correlation_id.clone()),
    );

    ctx.queue.enqueue(TranslationRequest::new(
        format!("paragraph:{}:high", paragraph.id),
        paragraph.id.clone(),
        paragraph.source_text.clone(),
        ctx.source_language.clone(),
        ctx.target_language.clone(),
        Priority::Low,
        QualityTier::High,
    ));
}

async fn paragraph_loop(
    mut builder: ParagraphBuilder,
    mut rx: mpsc::Receiver<Sentence>,
    ctx: Arc<StageCtx>,
) {
    loop {
        let deadline = builder.max_deadline();
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(sentence) => {
                    for paragraph in builder.push(sentence) {
                        emit_paragraph(&ctx, paragraph).await;
                    }
                }
                None => {
                    if let Some(paragraph) = builder.flush() {
                        emit_paragraph(&ctx, paragraph).await;
                    }
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                if let Some(paragraph) = builder.flush() {
                    emit_paragraph(&ctx, paragraph).await;
                }
            }
        }
    }
}

async fn display_loop(
    mut display: DisplayController,
    mut rx: mpsc::Receiver<DisplayMsg>,
    coalescer: Arc<StreamCoalescer>,
    correlation: String,
) {
    loop {
        let deadline = display.expire_deadline();
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(DisplayMsg::Source { unit_id, text, is_final }) => {
                    display.admit(&unit_id, &text, is_final);
                    push_snapshot(&display, &coalescer, &correlation).await;
                }
                Some(DisplayMsg::Translation { unit_id, target_text }) => {
                    if display.apply_translation(&unit_id, &target_text) {
                        push_snapshot(&display, &coalescer, &correlation).await;
                    }
                }
                None => {
                    // Final snapshot drains through the coalescer flush
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                if display.expire() {
                    push_snapshot(&display, &coalescer, &correlation).await;
                }
            }
        }
    }
}

async fn push_snapshot(
    display: &DisplayController,
    coalescer: &StreamCoalescer,
    correlation: &str,
) {
    let snapshot = display.snapshot();
    let text = snapshot
        .segments
        .iter()
        .map(|s| {
            format!(
                "{}\u{1}{}",
                s.source_text,
                s.target_text.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\u{2}");
    coalescer
        .submit(CoalescerInput {
            key: "display".to_string(),
            event: PipelineEvent::DisplayUpdate(snapshot),
            text,
            correlation_id: Some(correlation.to_string()),
        })
        .await;
}

async fn queue_loop(
    mut rx: mpsc::Receiver<QueueEvent>,
    ctx: Arc<StageCtx>,
    coalescer: Arc<StreamCoalescer>,
    request_correlations: Arc<DashMap<String, String>>,
) {
    // Accumulated target text per in-flight request, for display paints
    // and coalesced delta frames
    let mut accumulated: HashMap<String, String> = HashMap::new();

    let correlation_for = |request_id: &str, ctx: &StageCtx| {
        request_correlations
            .get(request_id)
            .map(|c| c.clone())
            .unwrap_or_else(|| ctx.correlation_id.clone())
    };

    while let Some(event) = rx.recv().await {
        if ctx.silenced() {
            continue;
        }
        match event {
            QueueEvent::Delta(delta) => {
                let text = {
                    let acc = accumulated.entry(delta.request_id.clone()).or_default();
                    acc.push_str(&delta.delta);
                    acc.clone()
                };
                let _ = ctx
                    .display_tx
                    .send(DisplayMsg::Translation {
                        unit_id: delta.source_unit_id.clone(),
                        target_text: text.clone(),
                    })
                    .await;
                let correlation = correlation_for(&delta.request_id, ctx.as_ref());
                coalescer
                    .submit(CoalescerInput {
                        key: format!("delta:{}", delta.request_id),
                        event: PipelineEvent::TranslationDelta(TranslationDelta {
                            request_id: delta.request_id.clone(),
                            source_unit_id: delta.source_unit_id,
                            delta: text.clone(),
                            quality_tier: delta.quality_tier,
                        }),
                        text,
                        correlation_id: Some(correlation),
                    })
                    .await;
            }
            QueueEvent::Complete(result) => {
                accumulated.remove(&result.request_id);
                let correlation = request_correlations
                    .remove(&result.request_id)
                    .map(|(_, c)| c)
                    .unwrap_or_else(|| ctx.correlation_id.clone());

                // Paragraph results update the historical record only;
                // the display keeps its sentence-level translations
                if result.quality_tier == QualityTier::Realtime {
                    let _ = ctx
                        .display_tx
                        .send(DisplayMsg::Translation {
                            unit_id: result.source_unit_id.clone(),
                            target_text: result.target_text.clone(),
                        })
                        .await;
                }
                ctx.bus.publish(
                    PipelineEvent::TranslationComplete(result),
                    Some(correlation),
                );
            }
            QueueEvent::Failed {
                request_id,
                source_unit_id,
                code,
                message,
                recoverable,
            } => {
                accumulated.remove(&request_id);
                let correlation = correlation_for(&request_id, ctx.as_ref());
                ctx.bus.publish(
                    PipelineEvent::Error(
                        ErrorPayload::new(code, message)
                            .recoverable(recoverable)
                            .with_context(serde_json::json!({
                                "request_id": request_id,
                                "source_unit_id": source_unit_id,
                            })),
                    ),
                    Some(correlation),
                );
            }
        }
    }
}

async fn audio_pump(
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    recognizer: Arc<AsyncMutex<Box<dyn SpeechRecognizer>>>,
    mut state_rx: watch::Receiver<PipelineState>,
) {
    loop {
        tokio::select! {
            frame = audio_rx.recv() => match frame {
                Some(frame) => {
                    let state = *state_rx.borrow();
                    match state {
                        // Forward while starting too: the session buffers
                        // until the link is up
                        PipelineState::Starting | PipelineState::Listening => {
                            let mut recognizer = recognizer.lock().await;
                            if let Err(e) = recognizer.send_audio(frame).await {
                                tracing::warn!(error = %e, "Audio forward failed");
                            }
                        }
                        // Paused: drop frames, keep-alive holds the link
                        _ => {}
                    }
                }
                None => break,
            },
            _ = state_rx.changed() => {
                if matches!(
                    *state_rx.borrow(),
                    PipelineState::Stopping | PipelineState::Error | PipelineState::Idle
                ) {
                    break;
                }
            }
        }
    }
}

async fn stats_loop(
    recognizer: Arc<AsyncMutex<Box<dyn SpeechRecognizer>>>,
    queue: Arc<TranslationQueue>,
    bus: EventBus,
    mut state_rx: watch::Receiver<PipelineState>,
    interval: Duration,
    correlation: String,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // immediate first tick carries nothing useful

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let asr = recognizer.lock().await.stats();
                bus.publish(
                    PipelineEvent::Stats(StatsPayload {
                        asr,
                        queue: queue.stats(),
                    }),
                    Some(correlation.clone()),
                );
            }
            _ = state_rx.changed() => {
                if matches!(
                    *state_rx.borrow(),
                    PipelineState::Stopping | PipelineState::Error | PipelineState::Idle
                ) {
                    break;
                }
            }
        }
    }
}
