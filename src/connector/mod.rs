//! Source connector capability.
//!
//! One implementation per source kind. A connector owns its native query,
//! its credentials, and its processed-marker mechanism; the rest of the
//! pipeline only sees `RawEvent`s and the marker operations.

pub mod mailbox;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;

use crate::error::ConnectorError;
use crate::event::{RawEvent, SourceType};

/// Health probe result. Expected degradation is data, not an error;
/// `health_check` only errors on programming misuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// One item of a fetch batch. An error for one item must not truncate the
/// batch, so failures are surfaced per slot.
pub type FetchItem = Result<RawEvent, FetchItemError>;

#[derive(Debug, Clone)]
pub struct FetchItemError {
    /// Unknown when the failure happened before the item id was read.
    pub source_id: Option<String>,
    pub reason: String,
}

/// Scope for the ops/test marker-reset capability.
#[derive(Debug, Clone, Copy)]
pub enum ResetScope<'a> {
    One(&'a str),
    All,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable connector id; scopes `source_id`s and processed markers.
    fn id(&self) -> &str;

    fn source_type(&self) -> SourceType;

    /// Establish or refresh credentials. Idempotent; safe when already
    /// connected.
    async fn connect(&self) -> Result<(), ConnectorError>;

    /// Side-effect-free probe used before each fetch cycle.
    async fn health_check(&self) -> Result<HealthStatus, ConnectorError>;

    /// Fetch up to `limit` items, excluding (via the native query) items that
    /// already bear this connector's processed marker. Transient API errors
    /// are retried internally with bounded backoff; exhaustion surfaces as
    /// `ConnectorError::Unavailable`.
    async fn fetch_events(&self, limit: usize) -> Result<Vec<FetchItem>, ConnectorError>;

    /// Apply the persisted marker at the source. Idempotent: re-applying is
    /// a no-op, not an error.
    async fn mark_processed(&self, source_id: &str) -> Result<(), ConnectorError>;

    /// Defensive re-check used by the processing engine before dispatch.
    async fn is_processed(&self, source_id: &str) -> Result<bool, ConnectorError>;

    /// Update the native filter without reconnecting. Optional capability.
    async fn set_query(&self, _query: &str) -> Result<(), ConnectorError> {
        Err(ConnectorError::Misuse(format!(
            "connector {} does not support set_query",
            self.id()
        )))
    }

    /// Remove markers for test fixtures and operational recovery.
    async fn reset_processed(&self, scope: ResetScope<'_>) -> Result<(), ConnectorError>;
}

/// Bounded exponential backoff with uniform jitter, shared by connector
/// retries and the extraction stage.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// capped, plus up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base
            .saturating_mul(1u32 << exp)
            .min(self.cap);
        let jitter_cap = raw.as_millis() as u64 / 4;
        let jitter = if jitter_cap > 0 {
            rand::rng().random_range(0..=jitter_cap)
        } else {
            0
        };
        raw + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_millis(400), 5);
        // Jitter adds at most 25%, so bounds are checkable.
        let d1 = b.delay(1);
        assert!(d1 >= Duration::from_millis(100) && d1 <= Duration::from_millis(125));
        let d2 = b.delay(2);
        assert!(d2 >= Duration::from_millis(200) && d2 <= Duration::from_millis(250));
        let d4 = b.delay(4);
        assert!(d4 >= Duration::from_millis(400) && d4 <= Duration::from_millis(500));
        // Large attempt counts must not overflow.
        let d40 = b.delay(40);
        assert!(d40 >= Duration::from_millis(400));
    }
}
