//! HTTP handlers for browsing the bucket.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `BucketStorage`.

use crate::{errors::AppError, models::object::BucketObject, services::sidecar, state::AppState};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tracing::debug;

/// GET `/api/files`: every object in the bucket.
pub async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<BucketObject>>, AppError> {
    let objects = state.storage.list("").await?;
    debug!("listed {} objects", objects.len());
    Ok(Json(objects))
}

/// GET `/api/files/{*key}`: download an object as a streaming response.
///
/// Snapshot archives are too large to proxy and are refused.
pub async fn get_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    reject_archive(&key)?;

    let object = state.storage.get(&key).await?;
    let content_type = object.content_type.clone();
    let length = object.content_length;

    let mut response = Response::new(Body::from_stream(object.stream));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), content_type.as_deref(), length);
    Ok(response)
}

/// Archives are never served through the API.
pub(crate) fn reject_archive(key: &str) -> Result<(), AppError> {
    if sidecar::classify(key).is_archive {
        return Err(AppError::forbidden(format!(
            "Downloading {} files is not allowed",
            sidecar::ARCHIVE_SUFFIX
        )));
    }
    Ok(())
}

pub(crate) fn set_object_headers(headers: &mut HeaderMap, content_type: Option<&str>, length: u64) {
    let content_type = content_type.unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
}
