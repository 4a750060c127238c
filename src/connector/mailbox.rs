//! Reference connector: a label-capable mailbox REST API.
//!
//! The processed marker is a mailbox label; the native query appends
//! `-label:<processed>` so already-handled messages never come back from a
//! fetch. The API surface assumed here is the minimal one the core needs
//! (search with a query, read one message, apply a label) so no vendor wire
//! format leaks into the pipeline; provider-specific search syntax stays
//! inside the configured query string.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Backoff, Connector, FetchItem, FetchItemError, HealthStatus, ResetScope};
use crate::error::ConnectorError;
use crate::event::{RawEvent, SourceType};

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Base URL of the mail API, e.g. `https://mail.example.com/api/v1`.
    pub base_url: String,
    pub api_token: String,
    /// Native search query, e.g. `is:unread`.
    pub query: String,
    /// Label that doubles as the processed marker.
    pub processed_label: String,
    pub backoff: Backoff,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    labels: Vec<String>,
}

pub struct MailboxConnector {
    id: String,
    http: reqwest::Client,
    cfg: MailboxConfig,
    query: Mutex<String>,
}

impl MailboxConnector {
    pub fn new(id: impl Into<String>, cfg: MailboxConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("eventflow/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        let query = Mutex::new(cfg.query.clone());
        Self {
            id: id.into(),
            http,
            cfg,
            query,
        }
    }

    /// Effective query: configured filter plus marker exclusion.
    fn effective_query(&self) -> String {
        let q = self.query.lock().unwrap_or_else(|e| e.into_inner());
        let base = q.trim();
        if base.is_empty() {
            format!("-label:{}", self.cfg.processed_label)
        } else {
            format!("{base} -label:{}", self.cfg.processed_label)
        }
    }

    fn classify(&self, e: reqwest::Error) -> ConnectorError {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ConnectorError::Connectivity(e.to_string())
        } else {
            ConnectorError::Other(e.into())
        }
    }

    fn classify_status(&self, status: reqwest::StatusCode) -> Option<ConnectorError> {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Some(ConnectorError::Auth {
                connector_id: self.id.clone(),
                reason: format!("mail API returned {status}"),
            });
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Some(ConnectorError::Connectivity(format!(
                "mail API status {status}"
            )));
        }
        None
    }

    async fn get_message(&self, source_id: &str) -> Result<Message, ConnectorError> {
        let url = format!("{}/messages/{source_id}", self.cfg.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.cfg.api_token)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        resp.json::<Message>()
            .await
            .map_err(|e| ConnectorError::Other(anyhow::anyhow!("message body: {e}")))
    }

    async fn search_once(&self, limit: usize) -> Result<Vec<FetchItem>, ConnectorError> {
        let url = format!("{}/messages", self.cfg.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.cfg.api_token)
            .query(&[
                ("q", self.effective_query()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        let search: SearchResponse = resp
            .json()
            .await
            .map_err(|e| ConnectorError::Other(anyhow::anyhow!("search body: {e}")))?;

        // Fetch bodies per item; one bad message must not drop the rest.
        let mut out = Vec::with_capacity(search.messages.len().min(limit));
        for m in search.messages.into_iter().take(limit) {
            match self.get_message(&m.id).await {
                Ok(msg) => out.push(Ok(self.to_raw_event(msg))),
                Err(e) => out.push(Err(FetchItemError {
                    source_id: Some(m.id),
                    reason: e.to_string(),
                })),
            }
        }
        Ok(out)
    }

    fn to_raw_event(&self, msg: Message) -> RawEvent {
        let mut payload = BTreeMap::new();
        payload.insert("subject".to_string(), serde_json::json!(msg.subject));
        payload.insert("from".to_string(), serde_json::json!(msg.from));
        payload.insert("body".to_string(), serde_json::json!(msg.body));
        RawEvent::new(self.id.clone(), msg.id, SourceType::Mail, payload)
    }
}

#[async_trait]
impl Connector for MailboxConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Mail
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        // Token-authenticated API: validating the token is the whole
        // handshake, so connect() is naturally idempotent.
        let url = format!("{}/profile", self.cfg.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.cfg.api_token)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthStatus, ConnectorError> {
        let url = format!("{}/profile", self.cfg.base_url);
        match self
            .http
            .get(&url)
            .bearer_auth(&self.cfg.api_token)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(HealthStatus::Healthy),
            Ok(resp) => Ok(HealthStatus::Degraded(format!(
                "mail API status {}",
                resp.status()
            ))),
            Err(e) => Ok(HealthStatus::Degraded(e.to_string())),
        }
    }

    async fn fetch_events(&self, limit: usize) -> Result<Vec<FetchItem>, ConnectorError> {
        let backoff = self.cfg.backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.search_once(limit).await {
                Ok(items) => return Ok(items),
                Err(e) if e.is_transient() && attempt < backoff.max_attempts => {
                    let delay = backoff.delay(attempt);
                    tracing::warn!(
                        target: "connector",
                        connector = %self.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient fetch error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ConnectorError::Unavailable {
                        connector_id: self.id.clone(),
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn mark_processed(&self, source_id: &str) -> Result<(), ConnectorError> {
        let url = format!("{}/messages/{source_id}/labels", self.cfg.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.cfg.api_token)
            .json(&serde_json::json!({ "label": self.cfg.processed_label }))
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        // 409 means the label is already on the message: idempotent success.
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        Ok(())
    }

    async fn is_processed(&self, source_id: &str) -> Result<bool, ConnectorError> {
        let msg = self.get_message(source_id).await?;
        Ok(msg.labels.iter().any(|l| l == &self.cfg.processed_label))
    }

    async fn set_query(&self, query: &str) -> Result<(), ConnectorError> {
        *self.query.lock().unwrap_or_else(|e| e.into_inner()) = query.to_string();
        Ok(())
    }

    async fn reset_processed(&self, scope: ResetScope<'_>) -> Result<(), ConnectorError> {
        match scope {
            ResetScope::One(source_id) => {
                let url = format!(
                    "{}/messages/{source_id}/labels/{}",
                    self.cfg.base_url, self.cfg.processed_label
                );
                let resp = self
                    .http
                    .delete(&url)
                    .bearer_auth(&self.cfg.api_token)
                    .send()
                    .await
                    .map_err(|e| self.classify(e))?;
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(());
                }
                if let Some(err) = self.classify_status(resp.status()) {
                    return Err(err);
                }
                Ok(())
            }
            ResetScope::All => Err(ConnectorError::Misuse(
                "mailbox connector cannot bulk-remove labels; reset per message".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(query: &str) -> MailboxConnector {
        MailboxConnector::new(
            "mail-1",
            MailboxConfig {
                base_url: "http://localhost:1".into(),
                api_token: "t".into(),
                query: query.into(),
                processed_label: "eventflow/processed".into(),
                backoff: Backoff::default(),
            },
        )
    }

    #[test]
    fn effective_query_appends_marker_exclusion() {
        let c = connector("is:unread from:school");
        assert_eq!(
            c.effective_query(),
            "is:unread from:school -label:eventflow/processed"
        );
    }

    #[test]
    fn empty_query_still_excludes_marker() {
        let c = connector("");
        assert_eq!(c.effective_query(), "-label:eventflow/processed");
    }

    #[tokio::test]
    async fn set_query_takes_effect_without_reconnect() {
        let c = connector("is:unread");
        c.set_query("from:school").await.unwrap();
        assert_eq!(
            c.effective_query(),
            "from:school -label:eventflow/processed"
        );
    }

    #[test]
    fn message_payload_maps_to_raw_event() {
        let c = connector("");
        let ev = c.to_raw_event(Message {
            id: "m1".into(),
            subject: "Picnic".into(),
            from: "teacher@school.example".into(),
            body: "Friday 10am".into(),
            labels: vec![],
        });
        assert_eq!(ev.source_id, "m1");
        assert_eq!(ev.connector_id, "mail-1");
        assert_eq!(ev.payload_str("subject"), Some("Picnic"));
        assert_eq!(ev.payload_str("body"), Some("Friday 10am"));
    }
}
