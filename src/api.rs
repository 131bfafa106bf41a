use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::pipeline::TickReport;
use crate::scheduler::LastTick;

#[derive(Clone)]
pub struct AppState {
    pub last_tick: LastTick,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct StatusOut {
    running: bool,
    last_tick: Option<TickReport>,
}

async fn status(State(state): State<AppState>) -> Json<StatusOut> {
    let last_tick = state
        .last_tick
        .read()
        .map(|g| g.clone())
        .unwrap_or_default();
    Json(StatusOut {
        running: last_tick.is_some(),
        last_tick,
    })
}
