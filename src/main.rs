//! Eventflow — Binary Entrypoint
//! Wires connectors, queue, processing engine, sinks, and the Axum
//! inspection surface, then runs until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use eventflow::config::{ConnectorDef, PipelineConfig, SinkDef};
use eventflow::connector::{mailbox::MailboxConfig, mailbox::MailboxConnector, memory::MemoryConnector, Backoff, Connector};
use eventflow::engine::ProcessingEngine;
use eventflow::llm::{CachingLlm, LlmClient, MockLlm, OpenAiClient};
use eventflow::metrics::Metrics;
use eventflow::orchestrator::{Orchestrator, OrchestratorSettings};
use eventflow::prompt::PromptManager;
use eventflow::queue::EventQueue;
use eventflow::sink::{EmailSink, EventSink, WebhookSink};
use eventflow::{api, SourceType};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn build_connector(def: &ConnectorDef, backoff: Backoff) -> Option<Arc<dyn Connector>> {
    match def.kind.as_str() {
        "mailbox" => {
            let base_url = def.base_url.clone()?;
            let token_env = def.api_token_env.as_deref().unwrap_or("MAIL_API_TOKEN");
            let api_token = match std::env::var(token_env) {
                Ok(t) => t,
                Err(_) => {
                    tracing::error!(connector = %def.id, env = token_env, "API token env var not set, skipping connector");
                    return None;
                }
            };
            Some(Arc::new(MailboxConnector::new(
                def.id.clone(),
                MailboxConfig {
                    base_url,
                    api_token,
                    query: def.query.clone(),
                    processed_label: def.processed_label.clone(),
                    backoff,
                },
            )))
        }
        "memory" => Some(Arc::new(MemoryConnector::new(
            def.id.clone(),
            SourceType::Mail,
        ))),
        other => {
            tracing::warn!(connector = %def.id, kind = other, "unknown connector type, skipping");
            None
        }
    }
}

fn build_sink(def: &SinkDef) -> Option<Arc<dyn EventSink>> {
    match def.kind.as_str() {
        "webhook" => {
            let url = def.url.clone()?;
            Some(Arc::new(WebhookSink::new(url)))
        }
        "email" => match EmailSink::from_env() {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                tracing::error!(error = %e, "email sink misconfigured, skipping");
                None
            }
        },
        other => {
            tracing::warn!(kind = other, "unknown sink type, skipping");
            None
        }
    }
}

fn build_llm(cfg: &PipelineConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.as_deref() {
        Some("openai") => match OpenAiClient::from_env(cfg.llm.model.as_deref()) {
            Ok(client) => {
                let cache_dir = cfg
                    .llm
                    .cache_dir
                    .clone()
                    .unwrap_or_else(|| "cache/llm".into());
                Arc::new(CachingLlm::new(client, cache_dir))
            }
            Err(e) => {
                tracing::error!(error = %e, "OpenAI client unavailable, extraction will fail until configured");
                Arc::new(MockLlm { fixed: "{}".into() })
            }
        },
        other => {
            tracing::warn!(provider = ?other, "no LLM provider configured, using inert mock");
            Arc::new(MockLlm { fixed: "{}".into() })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::load_default().context("loading configuration")?;
    let metrics = Metrics::init(cfg.pipeline.queue_capacity);

    let prompts = Arc::new(PromptManager::load_from_dir(&cfg.pipeline.prompts_dir)?);
    if prompts.is_empty() {
        tracing::warn!("no prompts loaded; every item will dead-letter");
    }

    let backoff = Backoff {
        max_attempts: cfg.pipeline.max_extract_attempts,
        ..Backoff::default()
    };
    let llm = build_llm(&cfg);
    let engine = Arc::new(
        ProcessingEngine::new(prompts, llm, backoff)
            .with_fallback_extraction(cfg.pipeline.fallback_extraction),
    );

    let connectors: Vec<Arc<dyn Connector>> = cfg
        .connectors
        .iter()
        .filter_map(|def| build_connector(def, backoff))
        .collect();
    let sinks: Vec<Arc<dyn EventSink>> = cfg.sinks.iter().filter_map(build_sink).collect();
    if connectors.is_empty() {
        tracing::warn!("no connectors configured; pipeline will idle");
    }

    let queue = Arc::new(EventQueue::new(cfg.pipeline.queue_capacity));
    let orchestrator = Arc::new(Orchestrator::new(
        connectors,
        queue,
        engine,
        sinks,
        OrchestratorSettings {
            fetch_interval: Duration::from_secs(cfg.pipeline.fetch_interval_secs),
            fetch_limit: cfg.pipeline.fetch_limit,
            workers: cfg.pipeline.workers,
            on_validation_failure: cfg.pipeline.on_validation_failure,
            on_sink_failure: cfg.pipeline.on_sink_failure,
        },
    ));

    orchestrator.start().await?;

    let router = api::create_router(api::AppState {
        orchestrator: orchestrator.clone(),
    })
    .merge(metrics.router());

    let addr = std::env::var("EVENTFLOW_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "inspection surface listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("ctrl-c received, shutting down");
        })
        .await?;

    orchestrator.stop().await;
    Ok(())
}
