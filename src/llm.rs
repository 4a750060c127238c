//! LLM capability: provider abstraction + response file cache.
//!
//! The core treats the model as a fallible remote call with two error
//! classes that matter: `Transient` (retry with backoff) and
//! `MalformedOutput` (one stricter re-prompt, then validation failure).

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LlmError;

/// `complete(system_prompt, user_prompt) -> text`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;

    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

/// OpenAI chat-completions provider. Requires `OPENAI_API_KEY`.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, model_override: Option<&str>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("eventflow/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_key,
            model: model_override.unwrap_or("gpt-4o-mini").to_string(),
        }
    }

    pub fn from_env(model_override: Option<&str>) -> Result<Self, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::Config("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(api_key, model_override))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::Config("empty OpenAI API key".into()));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system_prompt,
                },
                Msg {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.1,
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| LlmError::Transient(format!("request failed: {e}")))?;

        if let Some(err) = classify_provider_status(resp.status()) {
            return Err(err);
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| LlmError::MalformedOutput(format!("unparseable provider body: {e}")))?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(LlmError::MalformedOutput("empty completion".into()));
        }
        Ok(content)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

/// Deterministic client for tests and local runs.
#[derive(Clone)]
pub struct MockLlm {
    pub fixed: String,
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, LlmError> {
        Ok(self.fixed.clone())
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// File-cache wrapper: identical `(system, user)` pairs hit disk instead of
/// the provider. Cache hits never consume retry budget.
pub struct CachingLlm<C: LlmClient> {
    inner: C,
    cache_dir: PathBuf,
}

impl<C: LlmClient> CachingLlm<C> {
    pub fn new(inner: C, cache_dir: PathBuf) -> Self {
        let _ = fs::create_dir_all(&cache_dir);
        Self { inner, cache_dir }
    }

    fn cache_key(system_prompt: &str, user_prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(system_prompt.as_bytes());
        hasher.update([0u8]);
        hasher.update(user_prompt.as_bytes());
        let digest = hasher.finalize();
        format!("{digest:x}")
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.txt"))
    }

    fn read_cache(&self, key: &str) -> Option<String> {
        let s = fs::read_to_string(self.cache_path(key)).ok()?;
        (!s.is_empty()).then_some(s)
    }

    fn write_cache(&self, key: &str, value: &str) -> io::Result<()> {
        let path = self.cache_path(key);
        let tmp = path.with_extension("txt.tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(value.as_bytes())?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for CachingLlm<C> {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let key = Self::cache_key(system_prompt, user_prompt);
        if let Some(hit) = self.read_cache(&key) {
            return Ok(hit);
        }
        let fresh = self.inner.complete(system_prompt, user_prompt).await?;
        if let Err(e) = self.write_cache(&key, &fresh) {
            tracing::debug!(error = %e, "llm cache write failed");
        }
        Ok(fresh)
    }

    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }
}

/// Map a provider HTTP status to the error class the retry logic acts on.
/// Other 4xx (400, 404) mean the request itself is wrong: a stricter
/// re-prompt cannot change the status, so they are config errors, not
/// malformed output.
fn classify_provider_status(status: reqwest::StatusCode) -> Option<LlmError> {
    if status.is_success() {
        return None;
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Some(LlmError::Config(format!("provider rejected key: {status}")));
    }
    if status.as_u16() == 429 || status.is_server_error() {
        return Some(LlmError::Transient(format!("provider status {status}")));
    }
    Some(LlmError::Config(format!(
        "unexpected provider status {status}"
    )))
}

/// Strip Markdown code fences the model may wrap JSON in.
pub fn strip_code_fences(s: &str) -> &str {
    let t = s.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_and_order_sensitive() {
        let a = CachingLlm::<MockLlm>::cache_key("sys", "user");
        let b = CachingLlm::<MockLlm>::cache_key("sys", "user");
        let c = CachingLlm::<MockLlm>::cache_key("user", "sys");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn caching_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let client = CachingLlm::new(
            MockLlm {
                fixed: "{\"title\":\"x\"}".into(),
            },
            dir.path().to_path_buf(),
        );
        let first = client.complete("s", "u").await.unwrap();
        let second = client.complete("s", "u").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn provider_status_maps_to_error_class() {
        use reqwest::StatusCode;
        assert!(classify_provider_status(StatusCode::OK).is_none());
        assert!(matches!(
            classify_provider_status(StatusCode::UNAUTHORIZED),
            Some(LlmError::Config(_))
        ));
        assert!(matches!(
            classify_provider_status(StatusCode::TOO_MANY_REQUESTS),
            Some(LlmError::Transient(_))
        ));
        assert!(matches!(
            classify_provider_status(StatusCode::BAD_GATEWAY),
            Some(LlmError::Transient(_))
        ));
        // 400/404 never earn the strict re-prompt.
        assert!(matches!(
            classify_provider_status(StatusCode::BAD_REQUEST),
            Some(LlmError::Config(_))
        ));
        assert!(matches!(
            classify_provider_status(StatusCode::NOT_FOUND),
            Some(LlmError::Config(_))
        ));
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }
}
