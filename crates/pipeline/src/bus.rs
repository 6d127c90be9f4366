//! Typed event bus
//!
//! Single channel, multi-reader. The bus assigns a strictly increasing
//! sequence number per session, validates every serialized envelope against
//! the v1 schema on emit, and fans out over a bounded broadcast queue.
//! A lagging subscriber loses the oldest events and is handed an
//! `EVENT_BUS_OVERFLOW` error event instead of stalling producers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use lectern_core::{
    ErrorCode, ErrorPayload, EventEnvelope, PipelineEvent, EVENT_SCHEMA_VERSION,
};

/// Per-subscriber queue capacity
pub const BUS_CAPACITY: usize = 10_000;

struct Shared {
    tx: broadcast::Sender<EventEnvelope>,
    seq: AtomicU64,
}

impl Shared {
    fn emit(&self, correlation_id: Option<String>, event: PipelineEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let envelope = EventEnvelope::new(seq, correlation_id, event);
        // No subscribers is not an error
        let _ = self.tx.send(envelope);
        seq
    }
}

/// The event bus handle. Cheap to clone; all clones share one sequence.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                tx,
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event. Returns the assigned sequence number, or `None`
    /// when the event failed schema validation and was dropped (in which
    /// case a `SCHEMA_VIOLATION` error event is emitted instead).
    pub fn publish(
        &self,
        event: PipelineEvent,
        correlation_id: Option<String>,
    ) -> Option<u64> {
        // Validate the serialized form the subscriber will see
        let probe = EventEnvelope::new(0, correlation_id.clone(), event.clone());
        let value = match serde_json::to_value(&probe) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "Event failed to serialize, dropping");
                self.shared.emit(
                    correlation_id,
                    PipelineEvent::Error(ErrorPayload::new(
                        ErrorCode::SchemaViolation,
                        format!("unserializable event: {}", e),
                    )),
                );
                return None;
            }
        };

        if let Err(violation) = lectern_core::validate_event(&value) {
            tracing::error!(violation = %violation, "Event failed schema validation, dropping");
            self.shared.emit(
                correlation_id,
                PipelineEvent::Error(ErrorPayload::new(ErrorCode::SchemaViolation, violation)),
            );
            return None;
        }

        Some(self.shared.emit(correlation_id, event))
    }

    pub fn subscribe(&self) -> BusSubscriber {
        BusSubscriber {
            rx: self.shared.tx.subscribe(),
            shared: self.shared.clone(),
        }
    }
}

/// One subscriber's view of the bus
pub struct BusSubscriber {
    rx: broadcast::Receiver<EventEnvelope>,
    shared: Arc<Shared>,
}

impl BusSubscriber {
    /// Receive the next envelope. Returns `None` once the bus is gone.
    /// Envelopes with an unknown schema version are rejected and skipped.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.version == EVENT_SCHEMA_VERSION => {
                    return Some(envelope)
                }
                Ok(envelope) => {
                    tracing::warn!(version = envelope.version, "Rejecting unknown event version");
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Subscriber lagged, oldest events dropped");
                    self.shared.emit(
                        None,
                        PipelineEvent::Error(ErrorPayload::new(
                            ErrorCode::EventBusOverflow,
                            format!("{} events dropped for a lagging subscriber", missed),
                        )),
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for tests and polling consumers
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if envelope.version == EVENT_SCHEMA_VERSION => {
                    return Some(envelope)
                }
                Ok(_) => continue,
                Err(TryRecvError::Lagged(missed)) => {
                    self.shared.emit(
                        None,
                        PipelineEvent::Error(ErrorPayload::new(
                            ErrorCode::EventBusOverflow,
                            format!("{} events dropped for a lagging subscriber", missed),
                        )),
                    );
                }
                Err(_) => return None,
            }
        }
    }
}
