// tests/engine_retry.rs
// Extraction retry behavior: transient recovery, exhaustion, strict re-prompt.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use eventflow::connector::Backoff;
use eventflow::engine::{ProcessOutcome, ProcessingEngine};
use eventflow::error::LlmError;
use eventflow::event::{FailureStage, QueuedEvent, RawEvent, SourceType};
use eventflow::llm::LlmClient;
use eventflow::prompt::{FieldKind, FieldSpec, PromptManager, PromptSpec};

/// Replays a scripted sequence of completions, then repeats the last entry.
struct ScriptedLlm {
    script: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicU32,
}

impl ScriptedLlm {
    fn new(script: Vec<Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(Ok(s)) => Ok(s),
            Some(Err(e)) => Err(LlmError::Transient(e)),
            None => Err(LlmError::Transient("script exhausted".into())),
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

fn prompts() -> Arc<PromptManager> {
    let mut schema = BTreeMap::new();
    schema.insert(
        "title".to_string(),
        FieldSpec {
            kind: FieldKind::String,
            required: true,
        },
    );
    Arc::new(PromptManager::new(vec![PromptSpec {
        name: "general".into(),
        task: "event_extraction".into(),
        description: String::new(),
        system_prompt: "Extract the event as JSON.".into(),
        user_prompt_template: "{event_content}".into(),
        output_schema: schema,
        type_hints: vec![],
    }]))
}

fn queued(id: &str) -> QueuedEvent {
    let mut payload = BTreeMap::new();
    payload.insert("body".to_string(), serde_json::json!("picnic friday 10am"));
    QueuedEvent {
        sequence: 0,
        enqueued_at: Utc::now(),
        raw: RawEvent::new("mail-1", id, SourceType::Mail, payload),
    }
}

fn fast_backoff(max_attempts: u32) -> Backoff {
    Backoff::new(Duration::from_millis(1), Duration::from_millis(5), max_attempts)
}

#[tokio::test]
async fn two_transient_failures_then_success_produces_event() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Err("rate limited".into()),
        Err("timeout".into()),
        Ok(r#"{"title":"Picnic"}"#.into()),
    ]));
    let engine = ProcessingEngine::new(prompts(), llm.clone(), fast_backoff(3));

    match engine.process(&queued("m1")).await {
        ProcessOutcome::Validated(ev) => {
            assert!(ev.is_valid());
            assert_eq!(ev.structured_fields["title"], serde_json::json!("Picnic"));
        }
        other => panic!("expected validated event, got {other:?}"),
    }
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn exhausted_transient_retries_dead_letter() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Err("down".into()),
        Err("down".into()),
        Err("down".into()),
    ]));
    let engine = ProcessingEngine::new(prompts(), llm.clone(), fast_backoff(3));

    match engine.process(&queued("m1")).await {
        ProcessOutcome::Rejected(dead) => {
            assert_eq!(dead.stage, FailureStage::Extract);
            assert_eq!(dead.source_id, "m1");
        }
        other => panic!("expected dead letter, got {other:?}"),
    }
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn malformed_output_gets_one_strict_reprompt() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Ok("sure! the event is a picnic".into()),
        Ok(r#"{"title":"Picnic"}"#.into()),
    ]));
    let engine = ProcessingEngine::new(prompts(), llm.clone(), fast_backoff(3));

    match engine.process(&queued("m1")).await {
        ProcessOutcome::Validated(ev) => assert!(ev.is_valid()),
        other => panic!("expected validated event, got {other:?}"),
    }
    // First call malformed, second is the strict re-prompt.
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn persistently_malformed_output_becomes_validation_failure() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Ok("nope".into()),
        Ok("still nope".into()),
    ]));
    let engine = ProcessingEngine::new(prompts(), llm.clone(), fast_backoff(3));

    match engine.process(&queued("m1")).await {
        ProcessOutcome::Validated(ev) => {
            assert!(!ev.is_valid());
            assert!(ev.validation_errors[0].contains("malformed model output"));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn subjectless_school_mail_renders_subject_referencing_prompt() {
    let mut schema = BTreeMap::new();
    schema.insert(
        "title".to_string(),
        FieldSpec {
            kind: FieldKind::String,
            required: true,
        },
    );
    // The school prompt template references {subject}; a school-sender mail
    // without one must still render (empty subject), not dead-letter.
    let manager = Arc::new(PromptManager::new(vec![PromptSpec {
        name: "school".into(),
        task: "extract_school_event".into(),
        description: String::new(),
        system_prompt: "Extract the school event as JSON.".into(),
        user_prompt_template: "Subject: {subject}\n\n{event_content}".into(),
        output_schema: schema,
        type_hints: vec![],
    }]));
    let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"{"title":"Trip"}"#.into())]));
    let engine = ProcessingEngine::new(manager, llm.clone(), fast_backoff(3));

    let mut payload = BTreeMap::new();
    payload.insert("from".to_string(), serde_json::json!("teacher@school.example"));
    payload.insert("body".to_string(), serde_json::json!("Trip on Friday, bring boots"));
    let item = QueuedEvent {
        sequence: 0,
        enqueued_at: Utc::now(),
        raw: RawEvent::new("mail-1", "m1", SourceType::Mail, payload),
    };

    match engine.process(&item).await {
        ProcessOutcome::Validated(ev) => {
            assert!(ev.is_valid());
            assert_eq!(ev.prompt_name, "school");
        }
        other => panic!("expected validated event, got {other:?}"),
    }
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn fallback_extraction_replaces_dead_letter_when_enabled() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Err("down".into()),
        Err("down".into()),
        Err("down".into()),
    ]));
    let engine = ProcessingEngine::new(prompts(), llm.clone(), fast_backoff(3))
        .with_fallback_extraction(true);

    match engine.process(&queued("m1")).await {
        ProcessOutcome::Validated(ev) => {
            assert!(ev.is_valid());
            assert_eq!(
                ev.structured_fields["extraction_fallback"],
                serde_json::json!(true)
            );
            assert!(ev.structured_fields["title"].as_str().is_some());
        }
        other => panic!("expected fallback event, got {other:?}"),
    }
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn malformed_payload_is_terminal_without_llm_call() {
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let engine = ProcessingEngine::new(prompts(), llm.clone(), fast_backoff(3));

    let item = QueuedEvent {
        sequence: 0,
        enqueued_at: Utc::now(),
        raw: RawEvent::new("mail-1", "m1", SourceType::Mail, BTreeMap::new()),
    };
    match engine.process(&item).await {
        ProcessOutcome::Rejected(dead) => assert_eq!(dead.stage, FailureStage::Normalize),
        other => panic!("expected dead letter, got {other:?}"),
    }
    assert_eq!(llm.calls(), 0);
}
