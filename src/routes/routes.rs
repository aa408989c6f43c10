//! Defines routes for the temporary file-sharing API.
//!
//! ## Structure
//! - `POST /upload`  -> multipart upload (`file`, `duration`), returns `{"id"}`
//! - `GET  /i/{id}`  -> download as an attachment; 404 once expired
//! - `GET  /ping`    -> liveness ("pong")
//! - `GET  /healthz` -> liveness (JSON)
//! - `GET  /readyz`  -> readiness of metadata backend and blob disk

use crate::handlers::{
    health_handlers::{healthz, readyz},
    object_handlers::{AppState, download, ping, upload},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Headroom above the file size for multipart framing and the other fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build and return the router. Request bodies are capped at
/// `max_upload_bytes` plus multipart framing; the file size itself is checked
/// by the upload handler against `AppState::max_upload_bytes`.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(
                max_upload_bytes.saturating_add(MULTIPART_OVERHEAD),
            )),
        )
        .route("/i/{id}", get(download))
}
