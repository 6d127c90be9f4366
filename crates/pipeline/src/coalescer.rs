//! Stream coalescer
//!
//! Reduces the event rate toward the UI without losing semantic content.
//! Each logical stream keeps one pending value. A successive input that is
//! near-identical (similarity ≥ 0.95) replaces the pending value and
//! restarts the debounce window — the force-commit deadline, anchored at
//! the first pending input, keeps ticking so sustained input still emits
//! at least once per window. A dissimilar input flushes the pending value
//! immediately so distinct updates are never collapsed away.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use lectern_config::CoalescerConfig;
use lectern_core::{similarity, PipelineEvent};

/// Similarity at or above which successive inputs collapse
pub const COLLAPSE_SIMILARITY: f32 = 0.95;

/// One unit of coalescer input
#[derive(Debug)]
pub struct CoalescerInput {
    /// Logical stream key, e.g. `"display"` or `"delta:<request_id>"`
    pub key: String,
    pub event: PipelineEvent,
    /// Text representation used for the collapse comparison
    pub text: String,
    /// Correlation id to stamp on the emitted event
    pub correlation_id: Option<String>,
}

/// An emitted value with its correlation id
pub type CoalescedEvent = (PipelineEvent, Option<String>);

enum Msg {
    Input(CoalescerInput),
    FlushAll,
}

struct Pending {
    event: PipelineEvent,
    correlation_id: Option<String>,
    text: String,
    first_at: Instant,
    last_at: Instant,
}

impl Pending {
    fn emit_deadline(&self, config: &CoalescerConfig) -> Instant {
        let debounce = self.last_at + std::time::Duration::from_millis(config.debounce_ms);
        let force = self.first_at + std::time::Duration::from_millis(config.force_commit_ms);
        debounce.min(force)
    }
}

/// Handle to the coalescer task
pub struct StreamCoalescer {
    tx: mpsc::Sender<Msg>,
    task: JoinHandle<()>,
}

impl StreamCoalescer {
    /// Spawn the coalescer; emitted events arrive on the returned receiver
    pub fn new(config: CoalescerConfig) -> (Self, mpsc::Receiver<CoalescedEvent>) {
        let (tx, rx) = mpsc::channel::<Msg>(512);
        let (out_tx, out_rx) = mpsc::channel(256);
        let task = tokio::spawn(run(config, rx, out_tx));
        (Self { tx, task }, out_rx)
    }

    pub async fn submit(&self, input: CoalescerInput) {
        let _ = self.tx.send(Msg::Input(input)).await;
    }

    /// Immediately emit every pending value (pipeline stop)
    pub async fn flush_all(&self) {
        let _ = self.tx.send(Msg::FlushAll).await;
    }

    /// Flush and stop. Pending values drain to the output receiver first.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Msg::FlushAll).await;
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn run(
    config: CoalescerConfig,
    mut rx: mpsc::Receiver<Msg>,
    out_tx: mpsc::Sender<CoalescedEvent>,
) {
    let mut streams: HashMap<String, Pending> = HashMap::new();

    loop {
        let next_deadline = streams
            .values()
            .map(|p| p.emit_deadline(&config))
            .min();

        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Msg::Input(input)) => {
                    let now = Instant::now();
                    match streams.remove(&input.key) {
                        Some(mut pending) => {
                            if similarity::ratio(&pending.text, &input.text)
                                >= COLLAPSE_SIMILARITY
                            {
                                // Collapse: debounce restarts, force-commit does not
                                pending.event = input.event;
                                pending.correlation_id = input.correlation_id;
                                pending.text = input.text;
                                pending.last_at = now;
                                streams.insert(input.key, pending);
                            } else {
                                // Distinct content: flush the old value now
                                if out_tx
                                    .send((pending.event, pending.correlation_id))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                                streams.insert(
                                    input.key,
                                    Pending {
                                        event: input.event,
                                        correlation_id: input.correlation_id,
                                        text: input.text,
                                        first_at: now,
                                        last_at: now,
                                    },
                                );
                            }
                        }
                        None => {
                            streams.insert(
                                input.key,
                                Pending {
                                    event: input.event,
                                    correlation_id: input.correlation_id,
                                    text: input.text,
                                    first_at: now,
                                    last_at: now,
                                },
                            );
                        }
                    }
                }
                Some(Msg::FlushAll) => {
                    for (_, pending) in streams.drain() {
                        if out_tx
                            .send((pending.event, pending.correlation_id))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                None => {
                    for (_, pending) in streams.drain() {
                        let _ = out_tx.send((pending.event, pending.correlation_id)).await;
                    }
                    return;
                }
            },

            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() =>
            {
                let now = Instant::now();
                let due: Vec<String> = streams
                    .iter()
                    .filter(|(_, p)| now >= p.emit_deadline(&config))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in due {
                    if let Some(pending) = streams.remove(&key) {
                        if out_tx.send((pending.event, pending.correlation_id)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::{PipelineState, StatusPayload};
    use std::time::Duration;

    fn event(n: usize) -> PipelineEvent {
        // Payload identity only matters for assertions; reuse status events
        PipelineEvent::Status(StatusPayload::Connection {
            connected: n % 2 == 0,
            detail: Some(format!("v{}", n)),
        })
    }

    fn input(key: &str, n: usize, text: &str) -> CoalescerInput {
        CoalescerInput {
            key: key.into(),
            event: event(n),
            text: text.into(),
            correlation_id: None,
        }
    }

    fn detail(emitted: &CoalescedEvent) -> String {
        match &emitted.0 {
            PipelineEvent::Status(StatusPayload::Connection { detail, .. }) => {
                detail.clone().unwrap_or_default()
            }
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_emits_after_quiet_window() {
        let (coalescer, mut rx) = StreamCoalescer::new(CoalescerConfig::default());
        coalescer.submit(input("display", 1, "hello")).await;

        assert!(rx.try_recv().is_err());
        tokio::time::advance(Duration::from_millis(200)).await;
        let emitted = rx.recv().await.unwrap();
        assert_eq!(detail(&emitted), "v1");
        coalescer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_similar_inputs_collapse_to_latest() {
        let (coalescer, mut rx) = StreamCoalescer::new(CoalescerConfig::default());
        coalescer.submit(input("display", 1, "hello world")).await;
        tokio::time::advance(Duration::from_millis(50)).await;
        coalescer.submit(input("display", 2, "hello worlds")).await;

        tokio::time::advance(Duration::from_millis(200)).await;
        // One emission carrying the latest value
        assert_eq!(detail(&rx.recv().await.unwrap()), "v2");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        coalescer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dissimilar_input_flushes_pending_immediately() {
        let (coalescer, mut rx) = StreamCoalescer::new(CoalescerConfig::default());
        coalescer.submit(input("display", 1, "first sentence entirely")).await;
        tokio::time::advance(Duration::from_millis(50)).await;
        coalescer.submit(input("display", 2, "zzz qqq")).await;

        // The first value must not be lost
        let emitted = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail(&emitted), "v1");

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(detail(&rx.recv().await.unwrap()), "v2");
        coalescer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_commit_under_sustained_input() {
        let config = CoalescerConfig::default(); // debounce 160, force 1100
        let (coalescer, mut rx) = StreamCoalescer::new(config);

        // Similar input every 100 ms keeps resetting the debounce window;
        // the force-commit deadline still fires within 1.1 s.
        let mut text = String::from("grow");
        let mut emissions = 0;
        for n in 0..24 {
            text.push('x');
            coalescer.submit(input("display", n, &text)).await;
            tokio::time::advance(Duration::from_millis(100)).await;
            while rx.try_recv().is_ok() {
                emissions += 1;
            }
        }
        // 2.4 s of sustained input → roughly one emission per force window,
        // far below the 24 raw inputs
        assert!(emissions >= 1, "no emissions under sustained input");
        assert!(emissions <= 4, "{} emissions, coalescing ineffective", emissions);
        coalescer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_streams() {
        let (coalescer, mut rx) = StreamCoalescer::new(CoalescerConfig::default());
        coalescer.submit(input("a", 1, "stream a text")).await;
        coalescer.submit(input("b", 2, "stream b text")).await;

        tokio::time::advance(Duration::from_millis(200)).await;
        let mut seen = vec![detail(&rx.recv().await.unwrap())];
        seen.push(detail(&rx.recv().await.unwrap()));
        seen.sort();
        assert_eq!(seen, vec!["v1", "v2"]);
        coalescer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_shutdown() {
        let (coalescer, mut rx) = StreamCoalescer::new(CoalescerConfig::default());
        coalescer.submit(input("display", 7, "pending value")).await;
        coalescer.shutdown().await;

        assert_eq!(detail(&rx.recv().await.unwrap()), "v7");
    }
}
