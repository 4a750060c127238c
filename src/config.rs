//! Pipeline configuration.
//!
//! Loaded from TOML: explicit path, else `$EVENTFLOW_CONFIG_PATH`, else
//! `config/eventflow.toml`, else built-in defaults. Connector and sink
//! definitions are declarative tables; unknown types are skipped with a
//! warning at wiring time, not a crash.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_CONFIG_PATH: &str = "EVENTFLOW_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/eventflow.toml";

/// What to do with an event that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MarkPolicy {
    /// Leave the item unmarked so the next fetch retries it.
    #[default]
    RetryUntilValid,
    /// Mark it processed anyway; the dead-letter record is the only trace.
    MarkWithErrors,
}

/// What to do when some (not all) sinks acknowledged an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SinkFailurePolicy {
    /// Do not mark; the item stays eligible and may be re-dispatched.
    #[default]
    NeverMark,
    /// Mark anyway; accepted data-loss risk for the failed sinks.
    MarkAnyway,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub workers: usize,
    pub fetch_interval_secs: u64,
    pub fetch_limit: usize,
    pub max_extract_attempts: u32,
    /// Produce a degraded heuristic extraction (first line as title) instead
    /// of a dead letter when LLM retries exhaust. Off by default.
    pub fallback_extraction: bool,
    pub prompts_dir: PathBuf,
    pub on_validation_failure: MarkPolicy,
    pub on_sink_failure: SinkFailurePolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            workers: 2,
            fetch_interval_secs: 60,
            fetch_limit: 50,
            max_extract_attempts: 3,
            fallback_extraction: false,
            prompts_dir: PathBuf::from("prompts"),
            on_validation_failure: MarkPolicy::default(),
            on_sink_failure: SinkFailurePolicy::default(),
        }
    }
}

/// One declarative connector definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDef {
    /// Connector kind, e.g. "mailbox" or "memory".
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token_env: Option<String>,
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_processed_label")]
    pub processed_label: String,
}

fn default_processed_label() -> String {
    "eventflow/processed".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkDef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSettings,
    pub llm: LlmSettings,
    pub connectors: Vec<ConnectorDef>,
    pub sinks: Vec<SinkDef>,
}

impl PipelineConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Env var path first, then the conventional location, then defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::from_path(&pb);
            }
            anyhow::bail!("{ENV_CONFIG_PATH} points to non-existent path");
        }
        let conventional = PathBuf::from(DEFAULT_CONFIG_PATH);
        if conventional.exists() {
            return Self::from_path(&conventional);
        }
        Ok(Self::default())
    }
}
