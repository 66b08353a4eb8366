//! API route definitions.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/dead-letters", get(list_dead_letters))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let report = state.pipeline.health();
    Json(json!({ "data": report, "meta": meta() }))
}

pub(super) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.pipeline.metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                "metrics unavailable".to_string(),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> (StatusCode, Json<Value>) {
    let store = state.pipeline.sink.dead_letters();
    match store.list(params.limit) {
        Ok(letters) => {
            let total = store.count().unwrap_or(letters.len());
            let mut meta = meta();
            meta["total"] = json!(total);
            (StatusCode::OK, Json(json!({ "data": letters, "meta": meta })))
        }
        Err(e) => {
            error!(error = %e, "failed to list dead letters");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "data": null, "meta": { "error": e.to_string() } })),
            )
        }
    }
}
