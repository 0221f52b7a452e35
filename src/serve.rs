/// Read-only JSON API over the persisted metrics store.
///
/// The file is re-read on every request so the dashboard sees whatever the
/// agent loop last committed.
use crate::config::ServeConfig;
use crate::model::{AgentProfile, Event, GlobalSummary, Session};
use crate::store::Store;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
}

/// Build the API router for `store`.
pub fn router(store: Store) -> Router {
    let state = AppState {
        store: Arc::new(store),
    };
    Router::new()
        .route("/api/health", get(health))
        .route("/api/summary", get(summary))
        .route("/api/agents", get(agents))
        .route("/api/agents/{name}", get(agent))
        .route("/api/events", get(events))
        .route("/api/sessions/{id}", get(session))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn run(config: &ServeConfig, store: Store) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(store = %store.path().display(), "serve listening on {local_addr}");
    axum::serve(listener, router(store)).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn summary(State(state): State<AppState>) -> Json<GlobalSummary> {
    Json(state.store.peek().global_summary())
}

async fn agents(State(state): State<AppState>) -> Json<Vec<AgentProfile>> {
    Json(state.store.peek().list_agents())
}

async fn agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AgentProfile>, StatusCode> {
    state
        .store
        .peek()
        .agent_profile(&name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<Event>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(state.store.peek().recent_events(limit))
}

async fn session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, StatusCode> {
    state
        .store
        .peek()
        .session(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
