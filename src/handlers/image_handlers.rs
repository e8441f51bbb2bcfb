//! Thumbnail catalogue: `GET /images` and single-image lookup.

use crate::{
    errors::AppError, models::image_record::ImageRecord, services::listing_service::PageRequest,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NEXT_PAGE_TOKEN: &str = "x-next-page-token";

#[derive(Debug, Default, Deserialize)]
pub struct ListImagesQuery {
    pub limit: Option<u32>,
    pub token: Option<String>,
}

/// One catalogue entry as returned to clients.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageView {
    pub id: String,
    pub thumbnail_url: String,
}

/// Full catalogue entry for a single image.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetail {
    pub id: String,
    pub thumbnail_url: String,
    pub source_bucket: String,
    pub source_key: String,
    pub width: i64,
    pub height: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<ImageRecord> for ImageDetail {
    fn from(r: ImageRecord) -> Self {
        Self {
            id: r.id,
            thumbnail_url: r.thumbnail_url,
            source_bucket: r.source_bucket,
            source_key: r.source_key,
            width: r.width,
            height: r.height,
            updated_at: r.updated_at,
        }
    }
}

/// List every image that has a thumbnail. The body is always a JSON array;
/// when `limit` cuts the listing short the token for the next page is sent
/// in the `x-next-page-token` header.
pub async fn list_images(
    State(state): State<AppState>,
    Query(q): Query<ListImagesQuery>,
) -> Result<Response, AppError> {
    let page = state
        .listing
        .list_thumbnails(PageRequest {
            limit: q.limit,
            token: q.token,
        })
        .await?;

    let items: Vec<ImageView> = page
        .records
        .into_iter()
        .map(|r| ImageView {
            id: r.id,
            thumbnail_url: r.thumbnail_url,
        })
        .collect();

    let mut response = Json(items).into_response();
    if let Some(token) = page.next_token {
        if let Ok(value) = HeaderValue::from_str(&token) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(NEXT_PAGE_TOKEN), value);
        }
    }
    Ok(response)
}

/// `GET /images/{*id}`
pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ImageDetail>, AppError> {
    match state.listing.get_thumbnail(&id).await? {
        Some(record) => Ok(Json(record.into())),
        None => Err(AppError::new(
            StatusCode::NOT_FOUND,
            format!("no thumbnail for image `{}`", id),
        )),
    }
}
