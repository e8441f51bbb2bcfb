//! Read-only query path over the metadata table.

use crate::{
    models::image_record::ImageRecord,
    services::{
        metadata_service::{MetadataError, MetadataService},
        retry::{RetryPolicy, with_retry},
    },
};
use base64::{Engine as _, engine::general_purpose};
use thiserror::Error;

pub const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid pagination token")]
    InvalidToken,
    /// The metadata table could not be read. Callers may retry.
    #[error("metadata table unavailable: {0}")]
    Backend(#[from] MetadataError),
}

pub type ListingResult<T> = Result<T, ListingError>;

/// Optional pagination. `limit` is clamped to `1..=MAX_PAGE_SIZE`; without
/// it the remainder of the table is returned in one page.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: Option<u32>,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<ImageRecord>,
    /// Present when more records follow this page.
    pub next_token: Option<String>,
}

#[derive(Clone)]
pub struct ListingService {
    metadata: MetadataService,
    retry: RetryPolicy,
}

impl ListingService {
    pub fn new(metadata: MetadataService, retry: RetryPolicy) -> Self {
        Self { metadata, retry }
    }

    /// All known thumbnails in ascending id order.
    pub async fn list_thumbnails(&self, page: PageRequest) -> ListingResult<Page> {
        let after = page.token.as_deref().map(decode_token).transpose()?;
        let limit = page.limit.map(|l| l.clamp(1, MAX_PAGE_SIZE));
        // one extra row tells us whether another page exists
        let fetch_limit = limit.map(|l| l + 1);

        let metadata = &self.metadata;
        let after_ref = after.as_deref();
        let mut records = with_retry(&self.retry, "list_records", move || {
            metadata.list_records(after_ref, fetch_limit)
        })
        .await?;

        let mut next_token = None;
        if let Some(limit) = limit {
            if records.len() > limit as usize {
                records.truncate(limit as usize);
                next_token = records.last().map(|r| encode_token(&r.id));
            }
        }

        Ok(Page {
            records,
            next_token,
        })
    }

    /// One image by id, `None` when it has no thumbnail yet.
    pub async fn get_thumbnail(&self, id: &str) -> ListingResult<Option<ImageRecord>> {
        let metadata = &self.metadata;
        let record = with_retry(&self.retry, "get_record", move || metadata.get_record(id)).await?;
        Ok(record)
    }

    /// Number of catalogued images.
    pub async fn count(&self) -> ListingResult<i64> {
        Ok(self.metadata.count().await?)
    }
}

fn encode_token(id: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(id)
}

fn decode_token(token: &str) -> ListingResult<String> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(ListingError::InvalidToken)
}
