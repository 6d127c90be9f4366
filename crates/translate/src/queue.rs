//! Priority translation queue
//!
//! Three FIFO sub-queues (high, normal, low) drained by a dispatcher under
//! a global concurrency cap. Each in-flight item runs under a timeout;
//! retryable failures back off 500 ms → 1 s → 2 s for at most two retries.
//! A low item that has waited past the starvation window is promoted to
//! normal. `enqueue` is idempotent on `request_id`; `cancel` removes
//! pending items or aborts in-flight ones, and cancelled requests produce
//! no result event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::{TranslateError, Translator};
use lectern_core::{
    ErrorCode, Priority, QueueStats, TranslationDelta, TranslationRequest, TranslationResult,
};

/// Queue timings and caps
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrency: usize,
    /// Per-item timeout from start of execution
    pub timeout: Duration,
    /// Wait after which a low item is promoted to normal
    pub low_starvation: Duration,
    /// First retry backoff; doubles per retry
    pub retry_backoff: Duration,
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            timeout: Duration::from_millis(7_000),
            low_starvation: Duration::from_millis(30_000),
            retry_backoff: Duration::from_millis(500),
            max_retries: 2,
        }
    }
}

impl From<&lectern_config::QueueConfig> for QueueSettings {
    fn from(config: &lectern_config::QueueConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            timeout: Duration::from_millis(config.timeout_ms),
            low_starvation: Duration::from_millis(config.low_starvation_ms),
            ..Default::default()
        }
    }
}

/// Results surfaced by the queue
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Delta(TranslationDelta),
    Complete(TranslationResult),
    Failed {
        request_id: String,
        source_unit_id: String,
        code: ErrorCode,
        message: String,
        recoverable: bool,
    },
}

struct LiveTask {
    priority: Priority,
    source_unit_id: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    high: VecDeque<TranslationRequest>,
    normal: VecDeque<TranslationRequest>,
    low: VecDeque<TranslationRequest>,
    pending_ids: HashSet<String>,
    live: HashMap<String, LiveTask>,
    cumulative: QueueStats,
    shutdown: bool,
}

impl State {
    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<TranslationRequest> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    /// Move starved low items to the back of the normal queue. The low
    /// queue is FIFO, so checking from the front covers the oldest first.
    fn promote_starved(&mut self, window: Duration) {
        let now = Utc::now();
        while let Some(front) = self.low.front() {
            let waited = (now - front.enqueued_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if waited < window {
                break;
            }
            let mut item = self.low.pop_front().expect("front exists");
            tracing::debug!(request_id = %item.request_id, "Promoting starved low-priority request");
            item.priority = Priority::Normal;
            self.normal.push_back(item);
        }
    }

    /// Pop the next runnable request: high before normal before low,
    /// skipping items whose source unit already has an in-flight request
    /// at the same priority (per-unit single-flight).
    fn pick_next(&mut self) -> Option<TranslationRequest> {
        for priority in Priority::ALL {
            let blocked: HashSet<String> = self
                .live
                .values()
                .filter(|l| l.priority == priority)
                .map(|l| l.source_unit_id.clone())
                .collect();

            let queue = self.queue_mut(priority);
            if let Some(idx) = queue
                .iter()
                .position(|r| !blocked.contains(&r.source_unit_id))
            {
                let request = queue.remove(idx).expect("index in range");
                self.pending_ids.remove(&request.request_id);
                return Some(request);
            }
        }
        None
    }

    fn snapshot(&self) -> QueueStats {
        let mut stats = self.cumulative;
        stats.high.pending = self.high.len();
        stats.normal.pending = self.normal.len();
        stats.low.pending = self.low.len();
        for task in self.live.values() {
            stats.for_priority_mut(task.priority).in_flight += 1;
        }
        stats
    }
}

struct Inner {
    translator: Translator,
    settings: QueueSettings,
    state: Mutex<State>,
    notify: Notify,
    /// Taken on shutdown so the event stream closes once workers finish
    events_tx: Mutex<Option<mpsc::Sender<QueueEvent>>>,
}

impl Inner {
    fn events_sender(&self) -> Option<mpsc::Sender<QueueEvent>> {
        self.events_tx.lock().clone()
    }

    async fn emit(&self, event: QueueEvent) {
        if let Some(tx) = self.events_sender() {
            let _ = tx.send(event).await;
        }
    }
}

/// The translation dispatcher
pub struct TranslationQueue {
    inner: Arc<Inner>,
    dispatcher: JoinHandle<()>,
}

impl TranslationQueue {
    /// Create the queue and its event stream
    pub fn new(
        translator: Translator,
        settings: QueueSettings,
    ) -> (Self, mpsc::Receiver<QueueEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let inner = Arc::new(Inner {
            translator,
            settings,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            events_tx: Mutex::new(Some(events_tx)),
        });

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone()));
        (Self { inner, dispatcher }, events_rx)
    }

    /// Enqueue a request. Idempotent: a request id that is already pending
    /// or in flight makes this a no-op.
    pub fn enqueue(&self, mut request: TranslationRequest) -> String {
        let request_id = request.request_id.clone();
        let mut state = self.inner.state.lock();
        if state.shutdown
            || state.pending_ids.contains(&request_id)
            || state.live.contains_key(&request_id)
        {
            return request_id;
        }

        request.enqueued_at = Utc::now();
        state.pending_ids.insert(request_id.clone());
        let priority = request.priority;
        state.queue_mut(priority).push_back(request);
        drop(state);

        self.inner.notify.notify_one();
        request_id
    }

    /// Cancel a pending or in-flight request. Returns whether anything was
    /// cancelled. Cancelled requests emit no result event.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut state = self.inner.state.lock();

        if state.pending_ids.remove(request_id) {
            for priority in Priority::ALL {
                let queue = state.queue_mut(priority);
                if let Some(idx) = queue.iter().position(|r| r.request_id == request_id) {
                    queue.remove(idx);
                    state.cumulative.for_priority_mut(priority).cancelled += 1;
                    break;
                }
            }
            return true;
        }

        if let Some(task) = state.live.remove(request_id) {
            task.handle.abort();
            state.cumulative.for_priority_mut(task.priority).cancelled += 1;
            drop(state);
            self.inner.notify.notify_one();
            return true;
        }

        false
    }

    /// Current pending/in-flight/cumulative counts per priority
    pub fn stats(&self) -> QueueStats {
        self.inner.state.lock().snapshot()
    }

    /// Wait up to `grace` for the queue to empty, then cancel the
    /// remainder. Returns `true` when everything drained in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            {
                let state = self.inner.state.lock();
                if state.pending_ids.is_empty() && state.live.is_empty() {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.cancel_all();
                return false;
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), self.inner.notify.notified())
                .await;
        }
    }

    /// Cancel every pending and in-flight request
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock();
        for priority in Priority::ALL {
            let drained: Vec<_> = state.queue_mut(priority).drain(..).collect();
            state.cumulative.for_priority_mut(priority).cancelled += drained.len() as u64;
        }
        state.pending_ids.clear();
        let live: Vec<_> = state.live.drain().collect();
        for (_, task) in &live {
            task.handle.abort();
            state.cumulative.for_priority_mut(task.priority).cancelled += 1;
        }
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Stop the dispatcher, cancel everything, and close the event stream
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.cancel_all();
        self.dispatcher.abort();
        *self.inner.events_tx.lock() = None;
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        {
            let mut state = inner.state.lock();
            if state.shutdown {
                return;
            }
            state.promote_starved(inner.settings.low_starvation);

            while state.live.len() < inner.settings.max_concurrency {
                let Some(request) = state.pick_next() else {
                    break;
                };
                let priority = request.priority;
                let source_unit_id = request.source_unit_id.clone();
                let request_id = request.request_id.clone();
                let handle = tokio::spawn(run_request(inner.clone(), request));
                state.live.insert(
                    request_id,
                    LiveTask {
                        priority,
                        source_unit_id,
                        handle,
                    },
                );
            }
        }

        // Bounded wait: also serves as the starvation-promotion tick
        let _ = tokio::time::timeout(Duration::from_millis(500), inner.notify.notified()).await;
    }
}

async fn run_request(inner: Arc<Inner>, mut request: TranslationRequest) {
    let settings = inner.settings.clone();
    let mut attempt: u32 = 0;

    let outcome = loop {
        request.attempts = attempt;

        // Forward deltas to the event stream while this attempt runs
        let (delta_tx, mut delta_rx) = mpsc::channel::<TranslationDelta>(64);
        let events_tx = inner.events_sender();
        let forwarder = tokio::spawn(async move {
            while let Some(delta) = delta_rx.recv().await {
                if let Some(tx) = &events_tx {
                    let _ = tx.send(QueueEvent::Delta(delta)).await;
                }
            }
        });

        let attempt_result = tokio::time::timeout(
            settings.timeout,
            inner.translator.translate(&request, Some(delta_tx)),
        )
        .await;
        let _ = forwarder.await;

        match attempt_result {
            Err(_elapsed) => {
                // Dropping the timed-out future cancels the provider call
                inner
                    .state
                    .lock()
                    .cumulative
                    .for_priority_mut(request.priority)
                    .timed_out += 1;
                if attempt < settings.max_retries {
                    inner
                        .emit(QueueEvent::Failed {
                            request_id: request.request_id.clone(),
                            source_unit_id: request.source_unit_id.clone(),
                            code: ErrorCode::TranslationTimeout,
                            message: format!("attempt {} timed out", attempt + 1),
                            recoverable: true,
                        })
                        .await;
                    tokio::time::sleep(settings.retry_backoff * (1 << attempt)).await;
                    attempt += 1;
                    continue;
                }
                break Err((
                    ErrorCode::TranslationTimeout,
                    format!("timed out after {} attempts", attempt + 1),
                ));
            }
            Ok(Ok(result)) => break Ok(result),
            Ok(Err(e)) if e.is_retryable() && attempt < settings.max_retries => {
                let code = if e.is_rate_limited() {
                    ErrorCode::TranslationRateLimited
                } else {
                    ErrorCode::TranslationFailed
                };
                tracing::warn!(
                    request_id = %request.request_id,
                    error = %e,
                    attempt,
                    "Retryable translation failure"
                );
                inner
                    .emit(QueueEvent::Failed {
                        request_id: request.request_id.clone(),
                        source_unit_id: request.source_unit_id.clone(),
                        code,
                        message: e.to_string(),
                        recoverable: true,
                    })
                    .await;
                tokio::time::sleep(settings.retry_backoff * (1 << attempt)).await;
                attempt += 1;
                continue;
            }
            Ok(Err(e)) => {
                let code = match &e {
                    TranslateError::Timeout => ErrorCode::TranslationTimeout,
                    e if e.is_rate_limited() => ErrorCode::TranslationRateLimited,
                    _ => ErrorCode::TranslationFailed,
                };
                break Err((code, e.to_string()));
            }
        }
    };

    // A missing live entry means cancel() got here first: emit nothing.
    let finished = inner.state.lock().live.remove(&request.request_id);
    if let Some(task) = finished {
        match outcome {
            Ok(result) => {
                inner
                    .state
                    .lock()
                    .cumulative
                    .for_priority_mut(task.priority)
                    .completed += 1;
                inner.emit(QueueEvent::Complete(result)).await;
            }
            Err((code, message)) => {
                inner
                    .state
                    .lock()
                    .cumulative
                    .for_priority_mut(task.priority)
                    .failed += 1;
                inner
                    .emit(QueueEvent::Failed {
                        request_id: request.request_id.clone(),
                        source_unit_id: request.source_unit_id.clone(),
                        code,
                        message,
                        recoverable: false,
                    })
                    .await;
            }
        }
    }
    inner.notify.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendRequest, TranslationBackend};
    use async_trait::async_trait;
    use lectern_core::{Language, QualityTier};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Backend with a fixed per-call delay; tracks the concurrency
    /// high-water mark and can fail or stall the first N calls.
    struct StubBackend {
        delay: Duration,
        stall_first: u32,
        stall_delay: Duration,
        calls: AtomicU32,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl StubBackend {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                stall_first: 0,
                stall_delay: Duration::ZERO,
                calls: AtomicU32::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }

        fn stalling(stall_first: u32, stall_delay: Duration, delay: Duration) -> Self {
            Self {
                stall_first,
                stall_delay,
                ..Self::with_delay(delay)
            }
        }

        async fn run(&self, request: &BackendRequest) -> String {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(current, Ordering::SeqCst);

            let delay = if call < self.stall_first {
                self.stall_delay
            } else {
                self.delay
            };
            tokio::time::sleep(delay).await;

            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            format!("t:{}", request.user)
        }
    }

    #[async_trait]
    impl TranslationBackend for StubBackend {
        async fn complete(&self, request: &BackendRequest) -> Result<String, TranslateError> {
            Ok(self.run(request).await)
        }

        async fn complete_stream(
            &self,
            request: &BackendRequest,
            _tx: mpsc::Sender<String>,
        ) -> Result<String, TranslateError> {
            Ok(self.run(request).await)
        }

        fn model_for(&self, _tier: QualityTier) -> String {
            "stub".into()
        }
    }

    fn request(id: &str, unit: &str, priority: Priority) -> TranslationRequest {
        TranslationRequest::new(
            id,
            unit,
            format!("text {}", id),
            Language::new("en"),
            Language::new("ja"),
            priority,
            QualityTier::Realtime,
        )
    }

    fn queue_with(
        backend: Arc<StubBackend>,
        settings: QueueSettings,
    ) -> (TranslationQueue, mpsc::Receiver<QueueEvent>) {
        TranslationQueue::new(Translator::new(backend), settings)
    }

    async fn collect_completions(
        rx: &mut mpsc::Receiver<QueueEvent>,
        count: usize,
    ) -> Vec<TranslationResult> {
        let mut results = Vec::new();
        while results.len() < count {
            match rx.recv().await {
                Some(QueueEvent::Complete(result)) => results.push(result),
                Some(_) => {}
                None => break,
            }
        }
        results
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_and_wall_time() {
        let backend = Arc::new(StubBackend::with_delay(Duration::from_secs(1)));
        let (queue, mut rx) = queue_with(backend.clone(), QueueSettings::default());

        let started = tokio::time::Instant::now();
        for i in 0..6 {
            queue.enqueue(request(&format!("r{}", i), &format!("u{}", i), Priority::Normal));
        }

        let results = collect_completions(&mut rx, 6).await;
        assert_eq!(results.len(), 6);

        // 6 one-second items at concurrency 3 take ~2 s, not 6 s
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
        assert_eq!(backend.max_concurrent.load(Ordering::SeqCst), 3);

        let stats = queue.stats();
        assert_eq!(stats.normal.completed, 6);
        assert_eq!(stats.total_in_flight(), 0);
        queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_is_idempotent() {
        let backend = Arc::new(StubBackend::with_delay(Duration::from_millis(100)));
        let (queue, mut rx) = queue_with(backend.clone(), QueueSettings::default());

        queue.enqueue(request("dup", "unit", Priority::Normal));
        queue.enqueue(request("dup", "unit", Priority::Normal));

        let results = collect_completions(&mut rx, 1).await;
        assert_eq!(results.len(), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // No second result arrives
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_retry_succeeds() {
        // First call stalls past the 7 s timeout, second call is quick
        let backend = Arc::new(StubBackend::stalling(
            1,
            Duration::from_secs(8),
            Duration::from_millis(200),
        ));
        let (queue, mut rx) = queue_with(backend.clone(), QueueSettings::default());

        queue.enqueue(request("r1", "u1", Priority::Normal));

        let mut saw_timeout = false;
        let result = loop {
            match rx.recv().await.unwrap() {
                QueueEvent::Failed { code, recoverable, request_id, .. } => {
                    assert_eq!(code, ErrorCode::TranslationTimeout);
                    assert!(recoverable);
                    assert_eq!(request_id, "r1");
                    saw_timeout = true;
                }
                QueueEvent::Complete(result) => break result,
                QueueEvent::Delta(_) => {}
            }
        };
        assert!(saw_timeout);
        assert_eq!(result.request_id, "r1");
        assert_eq!(queue.stats().normal.timed_out, 1);
        assert_eq!(queue.stats().normal.completed, 1);
        queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order() {
        let backend = Arc::new(StubBackend::with_delay(Duration::from_secs(5)));
        let settings = QueueSettings {
            max_concurrency: 1,
            ..Default::default()
        };
        let (queue, mut rx) = queue_with(backend, settings);

        // First occupies the single slot; the rest queue up behind it
        queue.enqueue(request("first", "u0", Priority::Normal));
        tokio::time::sleep(Duration::from_millis(600)).await;
        queue.enqueue(request("low", "u1", Priority::Low));
        queue.enqueue(request("high", "u2", Priority::High));
        queue.enqueue(request("normal", "u3", Priority::Normal));

        let results = collect_completions(&mut rx, 4).await;
        let order: Vec<_> = results.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(order, vec!["first", "high", "normal", "low"]);
        queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_produces_no_event() {
        let backend = Arc::new(StubBackend::with_delay(Duration::from_secs(5)));
        let settings = QueueSettings {
            max_concurrency: 1,
            ..Default::default()
        };
        let (queue, mut rx) = queue_with(backend.clone(), settings);

        queue.enqueue(request("running", "u0", Priority::Normal));
        tokio::time::sleep(Duration::from_millis(600)).await;
        queue.enqueue(request("doomed", "u1", Priority::Normal));

        assert!(queue.cancel("doomed"));
        assert!(!queue.cancel("doomed"));

        let results = collect_completions(&mut rx, 1).await;
        assert_eq!(results[0].request_id, "running");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().normal.cancelled, 1);
        queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight() {
        let backend = Arc::new(StubBackend::with_delay(Duration::from_millis(300)));
        let (queue, mut rx) = queue_with(backend, QueueSettings::default());

        queue.enqueue(request("r1", "u1", Priority::Normal));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(queue.drain(Duration::from_secs(5)).await);
        let results = collect_completions(&mut rx, 1).await;
        assert_eq!(results.len(), 1);
        queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_cancels_after_grace() {
        let backend = Arc::new(StubBackend::with_delay(Duration::from_secs(60)));
        let (queue, _rx) = queue_with(backend, QueueSettings::default());

        queue.enqueue(request("stuck", "u1", Priority::Normal));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!queue.drain(Duration::from_millis(500)).await);
        let stats = queue.stats();
        assert_eq!(stats.normal.cancelled, 1);
        assert_eq!(stats.total_in_flight(), 0);
        assert_eq!(stats.total_pending(), 0);
        queue.shutdown();
    }

    #[test]
    fn test_starvation_promotion() {
        let mut state = State::default();
        let mut old = request("old-low", "u1", Priority::Low);
        old.enqueued_at = Utc::now() - chrono::Duration::seconds(60);
        state.low.push_back(old);
        state.low.push_back(request("fresh-low", "u2", Priority::Low));

        state.promote_starved(Duration::from_secs(30));

        assert_eq!(state.low.len(), 1);
        assert_eq!(state.normal.len(), 1);
        assert_eq!(state.normal[0].request_id, "old-low");
        assert_eq!(state.normal[0].priority, Priority::Normal);
    }

    #[test]
    fn test_per_unit_single_flight() {
        let mut state = State::default();
        state.live.insert(
            "live-1".into(),
            LiveTask {
                priority: Priority::Normal,
                source_unit_id: "unit-a".into(),
                handle: tokio::runtime::Runtime::new()
                    .unwrap()
                    .spawn(async {}),
            },
        );
        state.pending_ids.insert("r-blocked".into());
        state.pending_ids.insert("r-free".into());
        state.normal.push_back(request("r-blocked", "unit-a", Priority::Normal));
        state.normal.push_back(request("r-free", "unit-b", Priority::Normal));

        // unit-a already has an in-flight request, so unit-b runs first
        let picked = state.pick_next().unwrap();
        assert_eq!(picked.request_id, "r-free");
    }
}
