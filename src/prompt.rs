//! Prompt selection and template rendering.
//!
//! Prompt definitions live in `prompts/*.toml`; loading them is done once at
//! startup and the manager only consumes the resolved map. Selection order:
//! exact task id, then content-derived type hint, then the default
//! general-extraction prompt. Rendering validates required placeholders
//! instead of substituting permissively.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PromptError;

pub const DEFAULT_PROMPT_TASK: &str = "event_extraction";

/// Declared kind of one output-schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Datetime,
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

/// One named extraction task: system instruction, user template with
/// `{placeholder}` slots (at minimum `{event_content}`), and the output
/// schema the model response is validated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSpec {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    pub user_prompt_template: String,
    /// Field name -> declared kind + requiredness.
    pub output_schema: BTreeMap<String, FieldSpec>,
    /// Keywords that map a content-derived type hint to this prompt.
    #[serde(default)]
    pub type_hints: Vec<String>,
}

impl PromptSpec {
    /// Render the user template, failing on any placeholder without a value.
    pub fn render_user_prompt(
        &self,
        values: &BTreeMap<String, String>,
    ) -> Result<String, PromptError> {
        render_template(&self.name, &self.user_prompt_template, values)
    }
}

static RE_PLACEHOLDER: OnceCell<Regex> = OnceCell::new();

fn placeholder_re() -> &'static Regex {
    RE_PLACEHOLDER.get_or_init(|| Regex::new(r"\{([a-zA-Z0-9_]+)\}").unwrap())
}

fn render_template(
    template_name: &str,
    template: &str,
    values: &BTreeMap<String, String>,
) -> Result<String, PromptError> {
    let re = placeholder_re();
    let mut missing: Option<String> = None;
    let out = re.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match values.get(key) {
            Some(v) => v.clone(),
            None => {
                if missing.is_none() {
                    missing = Some(key.to_string());
                }
                String::new()
            }
        }
    });
    if let Some(placeholder) = missing {
        return Err(PromptError::MissingPlaceholder {
            template: template_name.to_string(),
            placeholder,
        });
    }
    Ok(out.into_owned())
}

/// Pure selection over a resolved prompt map.
pub struct PromptManager {
    by_task: BTreeMap<String, PromptSpec>,
}

impl PromptManager {
    pub fn new(prompts: Vec<PromptSpec>) -> Self {
        let mut by_task = BTreeMap::new();
        for p in prompts {
            // Index by task and by name; task wins on collision.
            by_task.entry(p.name.clone()).or_insert_with(|| p.clone());
            by_task.insert(p.task.clone(), p);
        }
        Self { by_task }
    }

    /// Load every `*.toml` under `dir`. Files that fail to parse are logged
    /// and skipped; a missing directory yields an empty manager.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut prompts = Vec::new();
        if dir.exists() {
            let entries = std::fs::read_dir(dir)
                .with_context(|| format!("reading prompts dir {}", dir.display()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("toml") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading prompt {}", path.display()))?;
                match toml::from_str::<PromptSpec>(&content) {
                    Ok(p) => prompts.push(p),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unparseable prompt file");
                    }
                }
            }
        } else {
            tracing::warn!(dir = %dir.display(), "prompts directory not found");
        }
        Ok(Self::new(prompts))
    }

    pub fn len(&self) -> usize {
        self.by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }

    pub fn get(&self, identifier: &str) -> Option<&PromptSpec> {
        self.by_task.get(identifier)
    }

    /// Resolution order: exact task id, then type-hint keyword match, then
    /// the default general-extraction prompt.
    pub fn select(
        &self,
        task_hint: Option<&str>,
        type_hint: Option<&str>,
    ) -> Result<&PromptSpec, PromptError> {
        if let Some(task) = task_hint {
            if let Some(p) = self.by_task.get(task) {
                return Ok(p);
            }
        }
        if let Some(hint) = type_hint {
            let hint_lc = hint.to_ascii_lowercase();
            // `{hint}_extraction` convention first, then declared keywords.
            if let Some(p) = self.by_task.get(&format!("{hint_lc}_extraction")) {
                return Ok(p);
            }
            if let Some(p) = self.by_task.values().find(|p| {
                p.type_hints
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(&hint_lc))
            }) {
                return Ok(p);
            }
        }
        self.by_task
            .get(DEFAULT_PROMPT_TASK)
            .ok_or(PromptError::NotFound {
                task: task_hint.map(str::to_string),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, task: &str, hints: &[&str]) -> PromptSpec {
        PromptSpec {
            name: name.into(),
            task: task.into(),
            description: String::new(),
            system_prompt: "You extract events.".into(),
            user_prompt_template: "Content: {event_content}".into(),
            output_schema: BTreeMap::new(),
            type_hints: hints.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn manager() -> PromptManager {
        PromptManager::new(vec![
            spec("general", DEFAULT_PROMPT_TASK, &[]),
            spec("school", "extract_school_event", &["school"]),
            spec("mail", "extract_mail_to_calendar", &[]),
            spec("meeting", "meeting_extraction", &[]),
        ])
    }

    #[test]
    fn exact_task_wins() {
        let m = manager();
        let p = m.select(Some("extract_mail_to_calendar"), Some("school")).unwrap();
        assert_eq!(p.name, "mail");
    }

    #[test]
    fn type_hint_convention_and_keywords() {
        let m = manager();
        assert_eq!(m.select(None, Some("meeting")).unwrap().name, "meeting");
        assert_eq!(m.select(None, Some("school")).unwrap().name, "school");
    }

    #[test]
    fn falls_back_to_default() {
        let m = manager();
        assert_eq!(m.select(Some("nope"), Some("nope")).unwrap().name, "general");
    }

    #[test]
    fn missing_default_is_not_found() {
        let m = PromptManager::new(vec![spec("school", "extract_school_event", &[])]);
        assert!(matches!(
            m.select(None, None),
            Err(PromptError::NotFound { .. })
        ));
    }

    #[test]
    fn render_fills_placeholders() {
        let p = spec("general", DEFAULT_PROMPT_TASK, &[]);
        let mut vals = BTreeMap::new();
        vals.insert("event_content".to_string(), "picnic friday".to_string());
        assert_eq!(p.render_user_prompt(&vals).unwrap(), "Content: picnic friday");
    }

    #[test]
    fn render_fails_on_missing_placeholder() {
        let p = spec("general", DEFAULT_PROMPT_TASK, &[]);
        let err = p.render_user_prompt(&BTreeMap::new()).unwrap_err();
        assert_eq!(
            err,
            PromptError::MissingPlaceholder {
                template: "general".into(),
                placeholder: "event_content".into(),
            }
        );
    }

    #[test]
    fn toml_prompt_parses() {
        let raw = r#"
name = "general"
task = "event_extraction"
system_prompt = "You extract calendar events as strict JSON."
user_prompt_template = "Extract the event from:\n{event_content}"

[output_schema.title]
kind = "string"
required = true

[output_schema.start_time]
kind = "datetime"
required = false
"#;
        let p: PromptSpec = toml::from_str(raw).unwrap();
        assert_eq!(p.task, "event_extraction");
        assert!(p.output_schema["title"].required);
        assert_eq!(p.output_schema["start_time"].kind, FieldKind::Datetime);
    }
}
