//! In-memory connector for tests, fixtures and local runs.
//!
//! Behaves like a real source: fetch excludes marked items (query-side
//! exclusion), marking is idempotent, and transient failures can be
//! scripted to exercise retry paths. Markers live in a `MemoryMarkerStore`,
//! the same backend a marker-less source would use in production.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Connector, FetchItem, HealthStatus, ResetScope};
use crate::error::ConnectorError;
use crate::event::{RawEvent, SourceType};
use crate::marker::{MarkerStore, MemoryMarkerStore};

struct State {
    connected: bool,
    query: String,
    items: VecDeque<RawEvent>,
    /// Number of upcoming fetch calls that fail with a transient error.
    fail_next_fetches: u32,
    degraded: Option<String>,
}

pub struct MemoryConnector {
    id: String,
    source_type: SourceType,
    state: Mutex<State>,
    markers: MemoryMarkerStore,
}

impl MemoryConnector {
    pub fn new(id: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            id: id.into(),
            source_type,
            state: Mutex::new(State {
                connected: false,
                query: String::new(),
                items: VecDeque::new(),
                fail_next_fetches: 0,
                degraded: None,
            }),
            markers: MemoryMarkerStore::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn marker_err(e: crate::error::MarkerError) -> ConnectorError {
        ConnectorError::Other(anyhow::anyhow!(e))
    }

    /// Seed a source item. Order is preserved into fetch order.
    pub fn push_item(&self, event: RawEvent) {
        self.state().items.push_back(event);
    }

    /// Pre-mark an item, as if a previous run already handled it.
    pub async fn preload_marker(&self, source_id: &str) {
        let _ = self.markers.apply(&self.id, source_id).await;
    }

    /// Script the next `n` fetch calls to fail with a connectivity error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.state().fail_next_fetches = n;
    }

    pub fn set_degraded(&self, reason: Option<&str>) {
        self.state().degraded = reason.map(str::to_string);
    }

    pub fn marked_ids(&self) -> Vec<String> {
        self.markers.ids_for(&self.id)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        self.state().connected = true;
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthStatus, ConnectorError> {
        let st = self.state();
        if !st.connected {
            return Ok(HealthStatus::Degraded("not connected".into()));
        }
        Ok(match &st.degraded {
            Some(reason) => HealthStatus::Degraded(reason.clone()),
            None => HealthStatus::Healthy,
        })
    }

    async fn fetch_events(&self, limit: usize) -> Result<Vec<FetchItem>, ConnectorError> {
        let candidates: Vec<RawEvent> = {
            let mut st = self.state();
            if !st.connected {
                return Err(ConnectorError::Misuse(format!(
                    "fetch before connect on {}",
                    self.id
                )));
            }
            if st.fail_next_fetches > 0 {
                st.fail_next_fetches -= 1;
                return Err(ConnectorError::Connectivity("scripted failure".into()));
            }
            st.items.iter().cloned().collect()
        };

        // Query-side exclusion: marked items never leave the source.
        let mut out = Vec::new();
        for ev in candidates {
            if out.len() == limit {
                break;
            }
            let marked = self
                .markers
                .contains(&self.id, &ev.source_id)
                .await
                .map_err(Self::marker_err)?;
            if !marked {
                out.push(Ok(ev));
            }
        }
        Ok(out)
    }

    async fn mark_processed(&self, source_id: &str) -> Result<(), ConnectorError> {
        // `AlreadyMarked` is success: re-applying is a no-op.
        self.markers
            .apply(&self.id, source_id)
            .await
            .map(|_| ())
            .map_err(Self::marker_err)
    }

    async fn is_processed(&self, source_id: &str) -> Result<bool, ConnectorError> {
        self.markers
            .contains(&self.id, source_id)
            .await
            .map_err(Self::marker_err)
    }

    async fn set_query(&self, query: &str) -> Result<(), ConnectorError> {
        self.state().query = query.to_string();
        Ok(())
    }

    async fn reset_processed(&self, scope: ResetScope<'_>) -> Result<(), ConnectorError> {
        match scope {
            ResetScope::One(id) => self.markers.remove(&self.id, id).await,
            ResetScope::All => self.markers.remove_all(&self.id).await,
        }
        .map_err(Self::marker_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn raw(id: &str) -> RawEvent {
        RawEvent::new("mem", id, SourceType::Mail, BTreeMap::new())
    }

    #[tokio::test]
    async fn fetch_excludes_marked_items() {
        let c = MemoryConnector::new("mem", SourceType::Mail);
        c.connect().await.unwrap();
        for id in ["m1", "m2", "m3"] {
            c.push_item(raw(id));
        }
        c.preload_marker("m2").await;

        let items = c.fetch_events(10).await.unwrap();
        let ids: Vec<_> = items
            .into_iter()
            .map(|i| i.unwrap().source_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m3"]);
    }

    #[tokio::test]
    async fn fetch_respects_limit() {
        let c = MemoryConnector::new("mem", SourceType::Mail);
        c.connect().await.unwrap();
        for id in ["a", "b", "c"] {
            c.push_item(raw(id));
        }
        assert_eq!(c.fetch_events(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn double_mark_is_noop() {
        let c = MemoryConnector::new("mem", SourceType::Mail);
        c.connect().await.unwrap();
        c.mark_processed("m1").await.unwrap();
        c.mark_processed("m1").await.unwrap();
        assert!(c.is_processed("m1").await.unwrap());
        assert_eq!(c.marked_ids(), vec!["m1"]);
    }

    #[tokio::test]
    async fn fetch_before_connect_is_misuse() {
        let c = MemoryConnector::new("mem", SourceType::Mail);
        assert!(matches!(
            c.fetch_events(1).await,
            Err(ConnectorError::Misuse(_))
        ));
    }

    #[tokio::test]
    async fn reset_restores_eligibility() {
        let c = MemoryConnector::new("mem", SourceType::Mail);
        c.connect().await.unwrap();
        c.push_item(raw("m1"));
        c.mark_processed("m1").await.unwrap();
        assert!(c.fetch_events(10).await.unwrap().is_empty());
        c.reset_processed(ResetScope::One("m1")).await.unwrap();
        assert_eq!(c.fetch_events(10).await.unwrap().len(), 1);
    }
}
