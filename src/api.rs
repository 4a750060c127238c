//! Operational inspection surface: `/health`, `/inspect`, `/dead-letters`.
//! `/metrics` is mounted separately by `metrics::Metrics::router`.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::cors::CorsLayer;

use crate::event::DeadLetter;
use crate::orchestrator::{Orchestrator, StatsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/inspect", get(inspect))
        .route("/dead-letters", get(dead_letters))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn inspect(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.orchestrator.snapshot())
}

async fn dead_letters(State(state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(state.orchestrator.dead_letters())
}
