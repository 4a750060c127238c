//! Core data model for the ingestion pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of external source a connector speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Mail,
    Webhook,
    File,
    Db,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Mail => "mail",
            SourceType::Webhook => "webhook",
            SourceType::File => "file",
            SourceType::Db => "db",
        }
    }
}

/// Raw item as produced by a connector. Immutable after creation; ownership
/// passes to the queue on enqueue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    /// Connector-scoped, stable, unique id of the underlying item.
    pub source_id: String,
    /// Id of the connector that produced this event.
    pub connector_id: String,
    pub source_type: SourceType,
    /// Field name -> opaque value (subject/body/headers for mail, arbitrary
    /// JSON for webhooks, ...). BTreeMap keeps serialization deterministic.
    pub raw_payload: BTreeMap<String, serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
    /// Optional hint used for prompt selection.
    pub type_hint: Option<String>,
}

impl RawEvent {
    pub fn new(
        connector_id: impl Into<String>,
        source_id: impl Into<String>,
        source_type: SourceType,
        raw_payload: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            connector_id: connector_id.into(),
            source_type,
            raw_payload,
            fetched_at: Utc::now(),
            type_hint: None,
        }
    }

    pub fn with_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.type_hint = Some(hint.into());
        self
    }

    /// String value of a payload field, if present.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.raw_payload.get(field).and_then(|v| v.as_str())
    }
}

/// A raw event wrapped with queue bookkeeping. Created by the queue on
/// enqueue, consumed exactly once by one worker.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
    pub raw: RawEvent,
}

/// Output of the LLM extraction stage. Transient; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Fields matching the active prompt's declared output schema.
    pub structured_fields: BTreeMap<String, serde_json::Value>,
    /// Model-reported confidence, when the prompt asks for one.
    pub confidence: Option<f64>,
    /// Verbatim model output, kept for diagnostics.
    pub raw_model_output: String,
    pub prompt_name: String,
}

/// Final pipeline artifact. `validation_errors` empty means the event is
/// eligible for calendar/notification sinks; non-empty routes it to the
/// failure sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedEvent {
    pub source_id: String,
    pub connector_id: String,
    pub event_type: String,
    pub structured_fields: BTreeMap<String, serde_json::Value>,
    pub validation_errors: Vec<String>,
    pub prompt_name: String,
    pub processed_at: DateTime<Utc>,
}

impl ValidatedEvent {
    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }
}

/// Persisted idempotency record for one `(connector_id, source_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedMarker {
    pub connector_id: String,
    pub source_id: String,
    pub marked_at: DateTime<Utc>,
}

/// Terminal stage a queued item reached, for dead-letter records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Normalize,
    Extract,
    Validate,
    Dispatch,
}

/// Diagnostic record for an item that failed terminally. No marker is
/// applied for a dead-lettered item, so it stays eligible for a manual
/// re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_id: String,
    pub connector_id: String,
    pub stage: FailureStage,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}
