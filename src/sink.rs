//! Calendar/notification sinks.
//!
//! The core only knows `dispatch(ValidatedEvent) -> ack | error`; which
//! calendar or channel sits behind that is a collaborator concern. Two real
//! sinks ship here (webhook, SMTP email) plus an in-memory sink for tests.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};
use reqwest::Client;

use crate::error::SinkError;
use crate::event::ValidatedEvent;

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Dispatch one validated event. Returning `Ok` is the acknowledgement
    /// the orchestrator's marking policy waits for.
    async fn dispatch(&self, event: &ValidatedEvent) -> Result<(), SinkError>;

    fn name(&self) -> &'static str;
}

/// Generic JSON webhook sink (calendar service hook, chat channel, ...).
pub struct WebhookSink {
    url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn dispatch(&self, event: &ValidatedEvent) -> Result<(), SinkError> {
        let payload = serde_json::json!({
            "source_id": event.source_id,
            "connector_id": event.connector_id,
            "event_type": event.event_type,
            "fields": event.structured_fields,
            "processed_at": event.processed_at.to_rfc3339(),
        });

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            match res {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_client_error() => {
                    // 4xx will not improve on retry.
                    return Err(SinkError::Rejected {
                        sink: "webhook".into(),
                        reason: format!("status {}", resp.status()),
                    });
                }
                Ok(resp) if attempt >= self.max_retries => {
                    return Err(SinkError::Unreachable {
                        sink: "webhook".into(),
                        reason: format!("status {} after {attempt} attempts", resp.status()),
                    });
                }
                Err(e) if attempt >= self.max_retries => {
                    return Err(SinkError::Unreachable {
                        sink: "webhook".into(),
                        reason: format!("{e} after {attempt} attempts"),
                    });
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// SMTP notification sink.
pub struct EmailSink {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailSink {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("SMTP_HOST").context("SMTP_HOST missing")?;
        let user = std::env::var("SMTP_USER").context("SMTP_USER missing")?;
        let pass = std::env::var("SMTP_PASS").context("SMTP_PASS missing")?;
        let from_addr = std::env::var("NOTIFY_EMAIL_FROM").context("NOTIFY_EMAIL_FROM missing")?;
        let to_addr = std::env::var("NOTIFY_EMAIL_TO").context("NOTIFY_EMAIL_TO missing")?;

        let creds = Credentials::new(user, pass);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .context("invalid SMTP_HOST")?
            .credentials(creds)
            .build();

        Ok(Self {
            from: from_addr.parse().context("invalid NOTIFY_EMAIL_FROM")?,
            to: to_addr.parse().context("invalid NOTIFY_EMAIL_TO")?,
            mailer,
        })
    }

    fn render_body(event: &ValidatedEvent) -> String {
        let title = event
            .structured_fields
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("(untitled)");
        let when = event
            .structured_fields
            .get("start_time")
            .and_then(|v| v.as_str())
            .unwrap_or("(no time)");
        format!(
            "Event: {title}\nType: {}\nWhen: {when}\nSource: {}/{}\n",
            event.event_type, event.connector_id, event.source_id
        )
    }
}

#[async_trait]
impl EventSink for EmailSink {
    async fn dispatch(&self, event: &ValidatedEvent) -> Result<(), SinkError> {
        let subject = format!("New event: {}", event.event_type);
        let msg = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(Self::render_body(event))
            .map_err(|e| SinkError::Rejected {
                sink: "email".into(),
                reason: format!("build message: {e}"),
            })?;

        self.mailer.send(msg).await.map_err(|e| SinkError::Unreachable {
            sink: "email".into(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

/// Collects dispatched events; test double and dead-letter drain target.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ValidatedEvent>>,
    fail_next: Mutex<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<ValidatedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock().unwrap_or_else(|e| e.into_inner()) = n;
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn dispatch(&self, event: &ValidatedEvent) -> Result<(), SinkError> {
        {
            let mut fail = self.fail_next.lock().unwrap_or_else(|e| e.into_inner());
            if *fail > 0 {
                *fail -= 1;
                return Err(SinkError::Unreachable {
                    sink: "memory".into(),
                    reason: "scripted failure".into(),
                });
            }
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
