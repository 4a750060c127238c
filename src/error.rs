//! Cross-cutting error types for the pipeline.
//!
//! Each component owns one enum; transient vs. terminal classification lives
//! here so retry loops never match on strings. Wiring code (`main`, tests)
//! still uses `anyhow` at the edges.

use thiserror::Error;

/// Errors raised by source connectors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Credentials invalid or expired. Fatal for the connector until
    /// re-authenticated; never retried automatically.
    #[error("authentication failed for connector {connector_id}: {reason}")]
    Auth { connector_id: String, reason: String },

    /// Transient network failure. Retried with backoff inside the connector.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Backoff budget exhausted; the fetch cycle is skipped for this interval.
    #[error("connector {connector_id} unavailable after {attempts} attempts")]
    Unavailable { connector_id: String, attempts: u32 },

    /// Misuse of the connector API (e.g. fetch before connect).
    #[error("connector misuse: {0}")]
    Misuse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    /// Transient errors are worth another attempt; everything else escalates.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Connectivity(_))
    }
}

/// Errors raised by the bounded event queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Capacity reached under the non-blocking enqueue policy. Backpressure
    /// signal, never silently swallowed.
    #[error("queue full (capacity {capacity})")]
    Full { capacity: usize },

    /// Shutdown was signaled; the queue accepts no new items.
    #[error("queue closed")]
    Closed,
}

/// Errors raised during prompt selection and rendering.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    /// No prompt resolves, not even the default. Configuration error.
    #[error("no prompt available for task {task:?}")]
    NotFound { task: Option<String> },

    /// A required template placeholder was not supplied. Programming or
    /// config error; fatal to the pipeline run, not retried.
    #[error("template {template}: missing placeholder {{{placeholder}}}")]
    MissingPlaceholder { template: String, placeholder: String },
}

/// Errors raised by the LLM capability.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Rate limit, timeout, 5xx. Retried with backoff and jitter.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Response did not conform to the requested output shape. Retried once
    /// with a stricter re-prompt, then treated as a validation failure.
    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    /// Missing API key, bad model name. Not retried.
    #[error("provider configuration error: {0}")]
    Config(String),
}

/// Errors raised by calendar/notification sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink {sink} rejected event: {reason}")]
    Rejected { sink: String, reason: String },

    #[error("sink {sink} unreachable: {reason}")]
    Unreachable { sink: String, reason: String },
}

/// Errors raised by the processed-marker store.
#[derive(Debug, Error)]
pub enum MarkerError {
    /// Concurrent writers raced on the same `(connector_id, source_id)` key.
    /// Resolved by retry-with-reread, never by silent last-write-wins.
    #[error("marker write conflict for {connector_id}/{source_id}")]
    Conflict {
        connector_id: String,
        source_id: String,
    },

    #[error("marker store unavailable: {0}")]
    Unavailable(String),
}
