//! Streaming ingestion-to-delivery pipeline
//!
//! Wires the recognizer session, segment coalescing, the translation queue,
//! display control, and the UI-update coalescer behind one typed event bus.
//! The orchestrator owns the lifecycle; everything else is reactive.

pub mod bus;
pub mod coalescer;
pub mod display;
pub mod orchestrator;
pub mod paragraph;
pub mod registry;
pub mod sentence;

pub use bus::{BusSubscriber, EventBus, BUS_CAPACITY};
pub use coalescer::{CoalescedEvent, CoalescerInput, StreamCoalescer, COLLAPSE_SIMILARITY};
pub use display::DisplayController;
pub use orchestrator::{Pipeline, RecognizerFactory};
pub use paragraph::ParagraphBuilder;
pub use registry::SegmentRegistry;
pub use sentence::SentenceCombiner;
