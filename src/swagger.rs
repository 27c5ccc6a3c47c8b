use axum::{response::Json, routing::get, Router};
use std::sync::Arc;
use utoipa::OpenApi;

use crate::{
    routes::{health::HealthResponse, ocr::OcrResponse},
    AppState,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::ocr::perform_ocr,
        crate::routes::health::health_check,
    ),
    components(schemas(OcrResponse, HealthResponse)),
    tags(
        (name = "ocr", description = "Formula recognition endpoints"),
        (name = "health", description = "Service health endpoints"),
    ),
    info(
        title = "mathink API",
        version = "0.3.1",
        description = "Local handwritten-math OCR service"
    )
)]
pub struct ApiDoc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDoc::openapi()) }),
    )
}
