//! Processing engine: normalize -> extract -> validate.
//!
//! Stage contract:
//! - Normalize is pure and deterministic; a malformed payload is terminal
//!   (dead letter), never retried.
//! - Extract renders the selected prompt and calls the LLM. Transient
//!   provider errors retry with bounded backoff + jitter; a malformed
//!   (non-schema) response gets exactly one stricter re-prompt, then counts
//!   as a validation failure.
//! - Validate checks the extraction against the prompt's declared output
//!   schema and produces a `ValidatedEvent`; violations populate
//!   `validation_errors` instead of failing the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;

use crate::connector::Backoff;
use crate::error::{LlmError, PromptError};
use crate::event::{
    DeadLetter, ExtractionResult, FailureStage, QueuedEvent, RawEvent, SourceType, ValidatedEvent,
};
use crate::llm::{strip_code_fences, LlmClient};
use crate::prompt::{FieldKind, FieldSpec, PromptManager, PromptSpec};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_normalized_total", "Items normalized.");
        describe_counter!("pipeline_normalize_failed_total", "Malformed payloads.");
        describe_counter!("pipeline_extracted_total", "Successful LLM extractions.");
        describe_counter!(
            "pipeline_extract_retries_total",
            "Transient extraction retries."
        );
        describe_counter!(
            "pipeline_extract_failed_total",
            "Extractions that exhausted retries."
        );
        describe_counter!("pipeline_validated_total", "Events passing validation.");
        describe_counter!(
            "pipeline_validation_failed_total",
            "Events with validation errors."
        );
        describe_counter!(
            "pipeline_fallback_extractions_total",
            "Degraded heuristic extractions after LLM exhaustion."
        );
        describe_histogram!("pipeline_extract_ms", "LLM extraction time in ms.");
    });
}

// ---------------------------------------------------------------------------
// Normalize
// ---------------------------------------------------------------------------

/// Canonical representation handed to the extract stage.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub source_id: String,
    pub connector_id: String,
    pub event_content: String,
    pub subject: Option<String>,
    pub from_email: Option<String>,
    /// Exact extraction task derived from content, when one applies.
    pub task_hint: Option<String>,
    /// Coarser hint carried over from the connector.
    pub type_hint: Option<String>,
}

/// Normalize free text: decode HTML entities, strip tags, collapse
/// whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // Cap: mail bodies can be huge; the prompt only needs the head.
    if out.chars().count() > 4000 {
        out = out.chars().take(4000).collect();
    }
    out
}

const CALENDAR_SUBJECT_HINTS: &[&str] = &["add to calendar", "calendar:"];
const SCHOOL_SENDER_HINTS: &[&str] = &[
    "school",
    "kindergarten",
    "preschool",
    "teacher",
    "headteacher",
    ".edu",
];

fn is_school_sender(from_email: &str) -> bool {
    SCHOOL_SENDER_HINTS.iter().any(|h| from_email.contains(h))
}

/// Fields the content text is looked up in, in order.
const CONTENT_FIELDS: &[&str] = &["body", "content", "text", "message", "description"];

/// Map a connector payload into the canonical text form. Pure; the only
/// failure is a payload with no usable content, which is terminal.
pub fn normalize(raw: &RawEvent) -> Result<NormalizedEvent, String> {
    let content_raw = CONTENT_FIELDS
        .iter()
        .find_map(|f| raw.payload_str(f))
        .map(str::to_string)
        .unwrap_or_else(|| {
            // Webhook-style payloads without a text field: serialize whole.
            if raw.raw_payload.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&raw.raw_payload).unwrap_or_default()
            }
        });

    let mut event_content = normalize_text(&content_raw);

    let subject = raw
        .payload_str("subject")
        .map(normalize_text)
        .filter(|s| !s.is_empty());
    let from_email = raw
        .payload_str("from")
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty());

    // A subject-only mail still carries enough to extract from.
    if event_content.is_empty() {
        if let Some(s) = &subject {
            event_content = s.clone();
        }
    }
    if event_content.is_empty() {
        return Err("payload has no extractable content".to_string());
    }

    let mut task_hint = None;
    if raw.source_type == SourceType::Mail {
        let subject_lc = subject.as_deref().unwrap_or_default().to_ascii_lowercase();
        if CALENDAR_SUBJECT_HINTS.iter().any(|h| subject_lc.contains(h)) {
            task_hint = Some("extract_mail_to_calendar".to_string());
        } else if from_email.as_deref().is_some_and(is_school_sender) {
            task_hint = Some("extract_school_event".to_string());
        }
    }

    Ok(NormalizedEvent {
        source_id: raw.source_id.clone(),
        connector_id: raw.connector_id.clone(),
        event_content,
        subject,
        from_email,
        task_hint,
        type_hint: raw.type_hint.clone(),
    })
}

// ---------------------------------------------------------------------------
// Extract
// ---------------------------------------------------------------------------

const STRICT_REPROMPT_SUFFIX: &str =
    "\nReturn ONLY one valid JSON object with the requested fields. No prose, no code fences.";

fn parse_model_output(prompt: &PromptSpec, raw_output: &str) -> Result<ExtractionResult, LlmError> {
    let cleaned = strip_code_fences(raw_output);
    let value: serde_json::Value = serde_json::from_str(cleaned)
        .map_err(|e| LlmError::MalformedOutput(format!("not valid JSON: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| LlmError::MalformedOutput("top-level value is not an object".into()))?;

    let structured_fields: BTreeMap<String, serde_json::Value> =
        obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let confidence = obj.get("confidence").and_then(|v| v.as_f64());

    Ok(ExtractionResult {
        structured_fields,
        confidence,
        raw_model_output: raw_output.to_string(),
        prompt_name: prompt.name.clone(),
    })
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check one value against its declared kind. Returns the coerced value or a
/// description of the mismatch.
fn coerce(
    field: &str,
    spec: &FieldSpec,
    value: &serde_json::Value,
) -> Result<serde_json::Value, String> {
    use serde_json::Value;
    match spec.kind {
        FieldKind::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            _ => Err(format!("field {field}: expected string")),
        },
        FieldKind::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| Value::Number(i.into()))
                .map_err(|_| format!("field {field}: expected integer, got {s:?}")),
            _ => Err(format!("field {field}: expected integer")),
        },
        FieldKind::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("field {field}: expected number, got {s:?}")),
            _ => Err(format!("field {field}: expected number")),
        },
        FieldKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("field {field}: expected boolean, got {s:?}")),
            },
            _ => Err(format!("field {field}: expected boolean")),
        },
        FieldKind::Datetime => match value {
            Value::String(s) => {
                let t = s.trim();
                if chrono::DateTime::parse_from_rfc3339(t).is_ok()
                    || chrono::NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S").is_ok()
                    || chrono::NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M").is_ok()
                    || chrono::NaiveDate::parse_from_str(t, "%Y-%m-%d").is_ok()
                {
                    Ok(Value::String(t.to_string()))
                } else {
                    Err(format!("field {field}: unparseable date/time {t:?}"))
                }
            }
            _ => Err(format!("field {field}: expected date/time string")),
        },
        FieldKind::List => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(format!("field {field}: expected list")),
        },
    }
}

fn is_empty_value(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Validate an extraction against the prompt's declared schema. Violations
/// populate `validation_errors`; this function never fails.
pub fn validate(
    normalized: &NormalizedEvent,
    extraction: &ExtractionResult,
    prompt: &PromptSpec,
) -> ValidatedEvent {
    let mut errors = Vec::new();
    let mut fields: BTreeMap<String, serde_json::Value> = BTreeMap::new();

    for (name, spec) in &prompt.output_schema {
        match extraction.structured_fields.get(name) {
            Some(v) if !is_empty_value(v) => match coerce(name, spec, v) {
                Ok(coerced) => {
                    fields.insert(name.clone(), coerced);
                }
                Err(e) => errors.push(e),
            },
            _ if spec.required => errors.push(format!("missing required field: {name}")),
            _ => {}
        }
    }

    // Reminder defaulting: 15 minutes before, when the schema carries the
    // field and the model left it out.
    if prompt.output_schema.contains_key("alert_before_minutes")
        && !fields.contains_key("alert_before_minutes")
    {
        fields.insert("alert_before_minutes".to_string(), serde_json::json!(15));
    }

    let event_type = fields
        .get("event_type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    ValidatedEvent {
        source_id: normalized.source_id.clone(),
        connector_id: normalized.connector_id.clone(),
        event_type,
        structured_fields: fields,
        validation_errors: errors,
        prompt_name: prompt.name.clone(),
        processed_at: Utc::now(),
    }
}

/// Degraded extraction when the LLM is out of reach: first line of the
/// content as the title, flagged so downstream consumers can tell it apart
/// from a real extraction.
fn fallback_extraction(normalized: &NormalizedEvent, prompt: &PromptSpec) -> ValidatedEvent {
    let title: String = normalized
        .subject
        .clone()
        .unwrap_or_else(|| normalized.event_content.chars().take(80).collect());

    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), serde_json::json!(title));
    fields.insert("extraction_fallback".to_string(), serde_json::json!(true));

    ValidatedEvent {
        source_id: normalized.source_id.clone(),
        connector_id: normalized.connector_id.clone(),
        event_type: "unknown".to_string(),
        structured_fields: fields,
        validation_errors: Vec::new(),
        prompt_name: prompt.name.clone(),
        processed_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Terminal outcome of one queued item.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Reached validation; check `validation_errors` for sink routing.
    Validated(ValidatedEvent),
    /// Failed terminally before validation.
    Rejected(DeadLetter),
}

pub struct ProcessingEngine {
    prompts: Arc<PromptManager>,
    llm: Arc<dyn LlmClient>,
    backoff: Backoff,
    fallback_extraction: bool,
}

impl ProcessingEngine {
    pub fn new(prompts: Arc<PromptManager>, llm: Arc<dyn LlmClient>, backoff: Backoff) -> Self {
        ensure_metrics_described();
        Self {
            prompts,
            llm,
            backoff,
            fallback_extraction: false,
        }
    }

    /// Enable the degraded heuristic extraction used when the LLM exhausts
    /// its retries. Off by default; dead-lettering is the safer outcome.
    pub fn with_fallback_extraction(mut self, enabled: bool) -> Self {
        self.fallback_extraction = enabled;
        self
    }

    /// Drive one item through the full pipeline.
    pub async fn process(&self, item: &QueuedEvent) -> ProcessOutcome {
        let raw = &item.raw;

        let normalized = match normalize(raw) {
            Ok(n) => {
                counter!("pipeline_normalized_total").increment(1);
                n
            }
            Err(reason) => {
                counter!("pipeline_normalize_failed_total").increment(1);
                return ProcessOutcome::Rejected(DeadLetter {
                    source_id: raw.source_id.clone(),
                    connector_id: raw.connector_id.clone(),
                    stage: FailureStage::Normalize,
                    reason,
                    occurred_at: Utc::now(),
                });
            }
        };

        let prompt = match self.prompts.select(
            normalized.task_hint.as_deref(),
            normalized.type_hint.as_deref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                // No usable prompt is a configuration error: terminal for the
                // item and loud in the logs.
                tracing::error!(target: "engine", error = %e, "prompt selection failed");
                return ProcessOutcome::Rejected(DeadLetter {
                    source_id: normalized.source_id.clone(),
                    connector_id: normalized.connector_id.clone(),
                    stage: FailureStage::Extract,
                    reason: e.to_string(),
                    occurred_at: Utc::now(),
                });
            }
        };

        match self.extract(&normalized, prompt).await {
            Ok(extraction) => {
                let validated = validate(&normalized, &extraction, prompt);
                if validated.is_valid() {
                    counter!("pipeline_validated_total").increment(1);
                } else {
                    counter!("pipeline_validation_failed_total").increment(1);
                    tracing::info!(
                        target: "engine",
                        source_id = %validated.source_id,
                        errors = ?validated.validation_errors,
                        "validation failed"
                    );
                }
                ProcessOutcome::Validated(validated)
            }
            Err(ExtractFailure::Exhausted { attempts, last }) => {
                counter!("pipeline_extract_failed_total").increment(1);
                if self.fallback_extraction {
                    counter!("pipeline_fallback_extractions_total").increment(1);
                    tracing::warn!(
                        target: "engine",
                        source_id = %normalized.source_id,
                        attempts,
                        %last,
                        "extraction exhausted, producing fallback event"
                    );
                    return ProcessOutcome::Validated(fallback_extraction(&normalized, prompt));
                }
                ProcessOutcome::Rejected(DeadLetter {
                    source_id: normalized.source_id.clone(),
                    connector_id: normalized.connector_id.clone(),
                    stage: FailureStage::Extract,
                    reason: format!("extraction exhausted {attempts} attempts: {last}"),
                    occurred_at: Utc::now(),
                })
            }
            Err(ExtractFailure::Render(e)) => {
                counter!("pipeline_extract_failed_total").increment(1);
                tracing::error!(target: "engine", error = %e, "template render failed");
                ProcessOutcome::Rejected(DeadLetter {
                    source_id: normalized.source_id.clone(),
                    connector_id: normalized.connector_id.clone(),
                    stage: FailureStage::Extract,
                    reason: e.to_string(),
                    occurred_at: Utc::now(),
                })
            }
            Err(ExtractFailure::Malformed { raw_output, reason }) => {
                // Strict re-prompt already spent; record the miss as a
                // validation failure so sink routing and marking policy apply.
                counter!("pipeline_validation_failed_total").increment(1);
                let extraction = ExtractionResult {
                    structured_fields: BTreeMap::new(),
                    confidence: None,
                    raw_model_output: raw_output,
                    prompt_name: prompt.name.clone(),
                };
                let mut validated = validate(&normalized, &extraction, prompt);
                validated
                    .validation_errors
                    .insert(0, format!("malformed model output: {reason}"));
                ProcessOutcome::Validated(validated)
            }
        }
    }

    async fn extract(
        &self,
        normalized: &NormalizedEvent,
        prompt: &PromptSpec,
    ) -> Result<ExtractionResult, ExtractFailure> {
        // Subject and sender are always bound (empty when the source had
        // none) so prompts that reference them render for every mail.
        let mut values = BTreeMap::new();
        values.insert(
            "event_content".to_string(),
            normalized.event_content.clone(),
        );
        values.insert(
            "subject".to_string(),
            normalized.subject.clone().unwrap_or_default(),
        );
        values.insert(
            "from_email".to_string(),
            normalized.from_email.clone().unwrap_or_default(),
        );

        let user_prompt = prompt
            .render_user_prompt(&values)
            .map_err(ExtractFailure::Render)?;

        let started = std::time::Instant::now();
        let result = self
            .complete_with_retry(&prompt.system_prompt, &user_prompt, prompt)
            .await;
        histogram!("pipeline_extract_ms").record(started.elapsed().as_millis() as f64);

        if result.is_ok() {
            counter!("pipeline_extracted_total").increment(1);
        }
        result
    }

    async fn complete_with_retry(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        prompt: &PromptSpec,
    ) -> Result<ExtractionResult, ExtractFailure> {
        let mut attempt = 0u32;
        let mut reprompted = false;
        let mut system = system_prompt.to_string();

        loop {
            attempt += 1;
            match self.llm.complete(&system, user_prompt).await {
                Ok(raw_output) => match parse_model_output(prompt, &raw_output) {
                    Ok(extraction) => return Ok(extraction),
                    Err(LlmError::MalformedOutput(reason)) if !reprompted => {
                        // One strict re-prompt; it does not consume the
                        // transient retry budget.
                        reprompted = true;
                        attempt -= 1;
                        system = format!("{system_prompt}{STRICT_REPROMPT_SUFFIX}");
                        tracing::debug!(target: "engine", %reason, "re-prompting strictly");
                    }
                    Err(LlmError::MalformedOutput(reason)) => {
                        return Err(ExtractFailure::Malformed { raw_output, reason })
                    }
                    Err(e) => {
                        return Err(ExtractFailure::Exhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        })
                    }
                },
                Err(LlmError::Transient(reason)) => {
                    if attempt >= self.backoff.max_attempts {
                        return Err(ExtractFailure::Exhausted {
                            attempts: attempt,
                            last: reason,
                        });
                    }
                    counter!("pipeline_extract_retries_total").increment(1);
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        target: "engine",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient extraction error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(LlmError::MalformedOutput(reason)) if !reprompted => {
                    reprompted = true;
                    attempt -= 1;
                    system = format!("{system_prompt}{STRICT_REPROMPT_SUFFIX}");
                    tracing::debug!(target: "engine", %reason, "re-prompting strictly");
                }
                Err(LlmError::MalformedOutput(reason)) => {
                    return Err(ExtractFailure::Malformed {
                        raw_output: String::new(),
                        reason,
                    })
                }
                Err(e @ LlmError::Config(_)) => {
                    return Err(ExtractFailure::Exhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
            }
        }
    }
}

enum ExtractFailure {
    /// Transient errors exhausted the attempt budget.
    Exhausted { attempts: u32, last: String },
    /// Model output stayed malformed after the strict re-prompt.
    Malformed { raw_output: String, reason: String },
    /// Missing template placeholder; config error, terminal.
    Render(PromptError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceType;
    use serde_json::json;

    fn mail_event(subject: &str, from: &str, body: &str) -> RawEvent {
        let mut payload = BTreeMap::new();
        payload.insert("subject".to_string(), json!(subject));
        payload.insert("from".to_string(), json!(from));
        payload.insert("body".to_string(), json!(body));
        RawEvent::new("mail-1", "m1", SourceType::Mail, payload)
    }

    #[test]
    fn normalize_strips_html_and_collapses_whitespace() {
        let ev = mail_event("Hi", "x@example.com", "<p>Picnic&nbsp; on   Friday</p>");
        let n = normalize(&ev).unwrap();
        assert_eq!(n.event_content, "Picnic on Friday");
    }

    #[test]
    fn normalize_detects_calendar_subject_hint() {
        let ev = mail_event("Please ADD TO CALENDAR: trip", "x@example.com", "details");
        let n = normalize(&ev).unwrap();
        assert_eq!(n.task_hint.as_deref(), Some("extract_mail_to_calendar"));
    }

    #[test]
    fn normalize_detects_school_sender() {
        let ev = mail_event("Trip", "office@greenfield-school.example", "details");
        let n = normalize(&ev).unwrap();
        assert_eq!(n.task_hint.as_deref(), Some("extract_school_event"));
    }

    #[test]
    fn subject_hint_outranks_sender_hint() {
        let ev = mail_event("add to calendar", "office@greenfield-school.example", "x");
        let n = normalize(&ev).unwrap();
        assert_eq!(n.task_hint.as_deref(), Some("extract_mail_to_calendar"));
    }

    #[test]
    fn empty_payload_is_terminal() {
        let ev = RawEvent::new("mail-1", "m1", SourceType::Mail, BTreeMap::new());
        assert!(normalize(&ev).is_err());
    }

    #[test]
    fn subject_only_mail_still_normalizes() {
        let ev = mail_event("Dentist Tuesday 9am", "mom@example.com", "");
        let n = normalize(&ev).unwrap();
        assert_eq!(n.event_content, "Dentist Tuesday 9am");
    }

    #[test]
    fn webhook_payload_without_text_field_serializes_whole() {
        let mut payload = BTreeMap::new();
        payload.insert("action".to_string(), json!("created"));
        let ev = RawEvent::new("wh-1", "w1", SourceType::Webhook, payload);
        let n = normalize(&ev).unwrap();
        assert!(n.event_content.contains("created"));
    }

    fn schema() -> BTreeMap<String, FieldSpec> {
        let mut s = BTreeMap::new();
        s.insert(
            "title".to_string(),
            FieldSpec {
                kind: FieldKind::String,
                required: true,
            },
        );
        s.insert(
            "start_time".to_string(),
            FieldSpec {
                kind: FieldKind::Datetime,
                required: false,
            },
        );
        s.insert(
            "participants".to_string(),
            FieldSpec {
                kind: FieldKind::List,
                required: false,
            },
        );
        s.insert(
            "alert_before_minutes".to_string(),
            FieldSpec {
                kind: FieldKind::Integer,
                required: false,
            },
        );
        s
    }

    fn test_prompt() -> PromptSpec {
        PromptSpec {
            name: "general".into(),
            task: "event_extraction".into(),
            description: String::new(),
            system_prompt: "extract".into(),
            user_prompt_template: "{event_content}".into(),
            output_schema: schema(),
            type_hints: vec![],
        }
    }

    fn normalized() -> NormalizedEvent {
        NormalizedEvent {
            source_id: "m1".into(),
            connector_id: "mail-1".into(),
            event_content: "picnic".into(),
            subject: None,
            from_email: None,
            task_hint: None,
            type_hint: None,
        }
    }

    fn extraction(fields: serde_json::Value) -> ExtractionResult {
        let obj = fields.as_object().unwrap();
        ExtractionResult {
            structured_fields: obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            confidence: None,
            raw_model_output: fields.to_string(),
            prompt_name: "general".into(),
        }
    }

    #[test]
    fn conforming_fields_validate_cleanly() {
        let ex = extraction(json!({
            "title": "Picnic",
            "start_time": "2026-09-04T10:00:00",
            "participants": ["class 2b"],
        }));
        let v = validate(&normalized(), &ex, &test_prompt());
        assert!(v.validation_errors.is_empty());
        assert_eq!(v.structured_fields["title"], json!("Picnic"));
        // Defaulted reminder.
        assert_eq!(v.structured_fields["alert_before_minutes"], json!(15));
    }

    #[test]
    fn missing_required_field_is_named() {
        let ex = extraction(json!({ "start_time": "2026-09-04" }));
        let v = validate(&normalized(), &ex, &test_prompt());
        assert!(v.validation_errors.iter().any(|e| e.contains("title")));
    }

    #[test]
    fn empty_required_string_counts_as_missing() {
        let ex = extraction(json!({ "title": "  " }));
        let v = validate(&normalized(), &ex, &test_prompt());
        assert!(!v.validation_errors.is_empty());
    }

    #[test]
    fn integer_coerces_from_string() {
        let ex = extraction(json!({ "title": "x", "alert_before_minutes": "30" }));
        let v = validate(&normalized(), &ex, &test_prompt());
        assert!(v.validation_errors.is_empty());
        assert_eq!(v.structured_fields["alert_before_minutes"], json!(30));
    }

    #[test]
    fn bad_datetime_is_a_violation() {
        let ex = extraction(json!({ "title": "x", "start_time": "next friday-ish" }));
        let v = validate(&normalized(), &ex, &test_prompt());
        assert!(v.validation_errors.iter().any(|e| e.contains("start_time")));
    }

    #[test]
    fn parse_model_output_handles_fences_and_confidence() {
        let p = test_prompt();
        let out = parse_model_output(&p, "```json\n{\"title\":\"x\",\"confidence\":0.9}\n```")
            .unwrap();
        assert_eq!(out.structured_fields["title"], json!("x"));
        assert_eq!(out.confidence, Some(0.9));
    }

    #[test]
    fn parse_model_output_rejects_non_object() {
        let p = test_prompt();
        assert!(matches!(
            parse_model_output(&p, "[1,2,3]"),
            Err(LlmError::MalformedOutput(_))
        ));
        assert!(matches!(
            parse_model_output(&p, "sure, here is the event"),
            Err(LlmError::MalformedOutput(_))
        ));
    }
}
