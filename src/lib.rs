// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod event;
pub mod llm;
pub mod marker;
pub mod metrics;
pub mod orchestrator;
pub mod prompt;
pub mod queue;
pub mod sink;

// ---- Re-exports for stable public API ----
pub use crate::config::{MarkPolicy, PipelineConfig, SinkFailurePolicy};
pub use crate::connector::{Backoff, Connector, HealthStatus};
pub use crate::engine::{ProcessOutcome, ProcessingEngine};
pub use crate::event::{RawEvent, SourceType, ValidatedEvent};
pub use crate::orchestrator::{Orchestrator, OrchestratorSettings};
pub use crate::queue::EventQueue;
