use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
    /// Whether the recognition worker process is currently running. The
    /// OCR endpoint itself always succeeds with (possibly empty) text, so
    /// this flag is the place to look when results come back empty.
    pub worker_alive: bool,
    pub timeout_s: f64,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(health_check))
}

#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses(
        (status = 200, description = "Service health and worker liveness", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        worker_alive: state.supervisor.worker_alive(),
        timeout_s: state.config.ocr_timeout.as_secs_f64(),
    })
}
