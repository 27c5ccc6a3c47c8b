use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use utoipa::ToSchema;

use crate::AppState;

/// Content types the upload endpoint accepts.
const ALLOWED_CONTENT_TYPES: &[&str] = &["image/png", "image/jpeg", "image/jpg", "image/webp"];

#[derive(Serialize, ToSchema)]
pub struct OcrResponse {
    /// The recognized formula markup. Empty when no formula was found or
    /// recognition failed; check /api/health for worker liveness.
    pub latex: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(perform_ocr))
}

#[utoipa::path(
    post,
    path = "/api/ocr",
    tag = "ocr",
    request_body(
        content = String,
        description = "Multipart form data with an image in the `file` field. Supported formats: PNG, JPEG, WebP.",
        content_type = "multipart/form-data"
    ),
    responses(
        (status = 200, description = "Recognition result (latex may be empty)", body = OcrResponse),
        (status = 400, description = "Missing or empty upload"),
        (status = 413, description = "Upload too large"),
        (status = 415, description = "Unsupported content type"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn perform_ocr(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<OcrResponse>, StatusCode> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!("failed to read multipart field: {}", e);
        StatusCode::BAD_REQUEST
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field.bytes().await.map_err(|e| {
            warn!("failed to read upload body: {}", e);
            StatusCode::BAD_REQUEST
        })?;
        upload = Some((content_type, data.to_vec()));
    }

    let (content_type, data) = upload.ok_or(StatusCode::BAD_REQUEST)?;

    if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
        warn!(content_type = %content_type, "rejecting upload: unsupported content type");
        return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
    if data.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if data.len() > state.config.max_upload_bytes {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    // The declared content type is cheap to fake; check the magic bytes
    // agree before the bytes go anywhere near the worker.
    match infer::get(&data) {
        Some(kind) if ALLOWED_CONTENT_TYPES.contains(&kind.mime_type()) => {}
        sniffed => {
            warn!(
                declared = %content_type,
                sniffed = sniffed.map(|k| k.mime_type()).unwrap_or("unknown"),
                "rejecting upload: magic bytes disagree with declared type"
            );
            return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        }
    }

    debug!(bytes = data.len(), "dispatching upload to worker");

    // Supervisor::process blocks (bounded by the deadline), so it runs on
    // the blocking pool rather than stalling the async runtime.
    let supervisor = state.supervisor.clone();
    let timeout = state.config.ocr_timeout;
    let latex = tokio::task::spawn_blocking(move || supervisor.process(data, timeout))
        .await
        .map_err(|e| {
            error!("OCR task failed to complete: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(OcrResponse { latex }))
}
