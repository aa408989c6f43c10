//! HTTP handlers for uploading and downloading expiring files.
//! Downloads stream the blob without buffering it; storage concerns are
//! delegated to `ObjectService`.

use crate::{
    errors::AppError,
    services::{
        error::StoreResult,
        object_service::{ObjectService, UploadRequest},
    },
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Duration as TtlDuration;
use futures::StreamExt;
use serde::Serialize;
use std::{future::Future, time::Duration};
use tokio_util::io::ReaderStream;

/// Lifetime used when `duration` is missing or not one of the choices.
pub const DEFAULT_DURATION: &str = "10m";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: ObjectService,

    /// Deadline for each storage call; on expiry the in-flight backend I/O
    /// is dropped.
    pub request_timeout: Duration,

    /// Largest accepted file, in bytes.
    pub max_upload_bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: String,
}

/// Map a form `duration` value to a lifetime. Unknown or missing values
/// fall back to [`DEFAULT_DURATION`].
pub fn parse_duration_choice(value: Option<&str>) -> TtlDuration {
    match value.map(str::trim).unwrap_or(DEFAULT_DURATION) {
        "1s" => TtlDuration::seconds(1),
        "1h" => TtlDuration::hours(1),
        "24h" => TtlDuration::hours(24),
        _ => TtlDuration::minutes(10),
    }
}

/// Run a storage call under `limit`.
async fn with_deadline<T>(
    limit: Duration,
    call: impl Future<Output = StoreResult<T>>,
) -> Result<T, AppError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "storage backend timed out",
        )),
    }
}

/// `POST /upload`: multipart form with `file` and optional `duration`.
///
/// The file part is read before storing because the identifier encodes the
/// expiration, and `duration` may arrive after the file.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut duration: Option<String> = None;
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("duration") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                duration = Some(value);
            }
            Some("file") => {
                let file_name = field.file_name().unwrap_or("unnamed").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                file = Some((file_name, data));
            }
            _ => {}
        }
    }

    let (file_name, data) = file.ok_or_else(|| AppError::bad_request("missing `file` field"))?;
    if data.len() > state.max_upload_bytes {
        return Err(AppError::bad_request(format!(
            "file exceeds the {} byte upload limit",
            state.max_upload_bytes
        )));
    }
    let request = UploadRequest {
        file_name,
        declared_length: Some(data.len() as u64),
        ttl: parse_duration_choice(duration.as_deref()),
    };
    let content = futures::stream::once(async move { Ok(data) }).boxed();

    let id = with_deadline(
        state.request_timeout,
        state.service.upload(content, request),
    )
    .await?;

    Ok(Json(UploadResponse { id: id.to_string() }))
}

/// `GET /i/{id}`: stream the file back as an attachment.
pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let object = with_deadline(state.request_timeout, state.service.get(&id)).await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(object.body)));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(
        response.headers_mut(),
        &object.record.file_name,
        object.record.length,
    );
    Ok(response)
}

/// `GET /ping`: liveness only.
pub async fn ping() -> impl IntoResponse {
    "pong"
}

fn set_download_headers(headers: &mut HeaderMap, file_name: &str, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_bytes(content_disposition(file_name).as_bytes())
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
}

/// `attachment; filename="<name>"` with quotes and backslashes escaped and
/// control characters replaced.
fn content_disposition(file_name: &str) -> String {
    let mut escaped = String::with_capacity(file_name.len());
    for c in file_name.chars() {
        match c {
            '"' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            c if c.is_control() => escaped.push('_'),
            c => escaped.push(c),
        }
    }
    format!("attachment; filename=\"{escaped}\"")
}
