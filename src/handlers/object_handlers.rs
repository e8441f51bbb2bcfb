//! HTTP handlers for object and bucket operations.
//! Streams object bodies to avoid buffering in memory. Uploads go through
//! the ingestion trigger, which stores the object and queues its thumbnail
//! job atomically.

use crate::{errors::AppError, models::object::Object, state::AppState};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;

const MESSAGE_ID: &str = "x-message-id";

/// Optional request body for `PUT /objects/{bucket}` (create bucket).
#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BucketView {
    pub name: String,
    pub region: String,
}

/// Upload an object to `/objects/{bucket}/{*key}`.
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let (object, message_id) = state
        .ingestion
        .on_object_created(&bucket, &key, content_type, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    let resp_headers = response.headers_mut();
    if let Some(etag) = object.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            resp_headers.insert(header::ETAG, value);
        }
    }
    if let Some(id) = message_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            resp_headers.insert(HeaderName::from_static(MESSAGE_ID), value);
        }
    }
    Ok(response)
}

/// Download an object as a streaming response.
pub async fn get_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, file) = state.storage.get_object_reader(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// Same headers as GET, no body.
pub async fn head_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let meta = state.storage.get_object_metadata(&bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

pub async fn delete_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.storage.delete_object(&bucket, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /objects/{bucket}`. Idempotent: an existing bucket is returned as is.
pub async fn create_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    payload: Option<Json<CreateBucketReq>>,
) -> Result<impl IntoResponse, AppError> {
    let region = payload
        .and_then(|Json(p)| p.region)
        .unwrap_or_else(|| "us-west-2".into());

    let created = state.storage.ensure_bucket(&bucket, &region).await?;
    Ok(Json(BucketView {
        name: created.name,
        region: created.region,
    }))
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));

    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
