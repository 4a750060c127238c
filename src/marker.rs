//! Processed-marker store: the idempotency record behind `mark_processed`.
//!
//! Remote sources that support labels/tags keep markers at the source (the
//! mailbox connector does this). Everything else uses a `MarkerStore`
//! backend. Writes must serialize per `(connector_id, source_id)` key:
//! `apply` has compare-and-set semantics so retried operations never
//! double-apply or clobber each other.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::MarkerError;
use crate::event::ProcessedMarker;

/// Outcome of an atomic marker apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The marker was written by this call.
    Applied,
    /// A marker already existed. Success: re-applying is a no-op.
    AlreadyMarked,
}

#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Atomically apply a marker for `(connector_id, source_id)`.
    async fn apply(
        &self,
        connector_id: &str,
        source_id: &str,
    ) -> Result<ApplyOutcome, MarkerError>;

    async fn contains(&self, connector_id: &str, source_id: &str) -> Result<bool, MarkerError>;

    /// Remove one marker. Ops/test capability, not in the hot path.
    async fn remove(&self, connector_id: &str, source_id: &str) -> Result<(), MarkerError>;

    /// Remove every marker for a connector. Ops/test capability.
    async fn remove_all(&self, connector_id: &str) -> Result<(), MarkerError>;
}

/// In-memory backend for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryMarkerStore {
    inner: Mutex<HashMap<(String, String), ProcessedMarker>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted source ids marked for one connector. Diagnostic helper.
    pub fn ids_for(&self, connector_id: &str) -> Vec<String> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = map
            .keys()
            .filter(|(cid, _)| cid == connector_id)
            .map(|(_, sid)| sid.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn apply(
        &self,
        connector_id: &str,
        source_id: &str,
    ) -> Result<ApplyOutcome, MarkerError> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (connector_id.to_string(), source_id.to_string());
        // Entry-based insert keeps the check and the write under one lock,
        // which is the compare-and-set this backend needs.
        if map.contains_key(&key) {
            return Ok(ApplyOutcome::AlreadyMarked);
        }
        map.insert(
            key,
            ProcessedMarker {
                connector_id: connector_id.to_string(),
                source_id: source_id.to_string(),
                marked_at: Utc::now(),
            },
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn contains(&self, connector_id: &str, source_id: &str) -> Result<bool, MarkerError> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.contains_key(&(connector_id.to_string(), source_id.to_string())))
    }

    async fn remove(&self, connector_id: &str, source_id: &str) -> Result<(), MarkerError> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&(connector_id.to_string(), source_id.to_string()));
        Ok(())
    }

    async fn remove_all(&self, connector_id: &str) -> Result<(), MarkerError> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|(cid, _), _| cid != connector_id);
        Ok(())
    }
}

/// Retry an `apply` once with a re-read when the backend reports a write
/// conflict. Conflicts mean another worker won the race, so the re-read
/// normally lands on `AlreadyMarked`.
pub async fn apply_with_conflict_retry(
    store: &dyn MarkerStore,
    connector_id: &str,
    source_id: &str,
) -> Result<ApplyOutcome, MarkerError> {
    match store.apply(connector_id, source_id).await {
        Err(MarkerError::Conflict { .. }) => {
            if store.contains(connector_id, source_id).await? {
                Ok(ApplyOutcome::AlreadyMarked)
            } else {
                store.apply(connector_id, source_id).await
            }
        }
        other => other,
    }
}
