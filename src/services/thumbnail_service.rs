//! Thumbnail generation: decode the original, fit it inside a square
//! bounding box, re-encode, store it and record it.
//!
//! Decoding and resizing are CPU-bound and run on the blocking pool.
//! Every step is an overwrite keyed by image id, so running `process` twice
//! for the same message, or concurrently, converges on the same state.

use crate::{
    models::{
        image_record::{ImageRecord, NewImageRecord, image_id_from_key},
        queue_message::{ObjectCreatedEvent, QueueMessage},
    },
    services::{
        ingestion::is_thumbnail_key,
        metadata_service::{MetadataError, RecordStore},
        retry::{RetryPolicy, with_retry},
        storage_service::{ObjectStore, StorageError},
    },
};
use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageOutputFormat, imageops::FilterType};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::{io::Cursor, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Characters that must be percent-encoded in a single path segment
const SEGMENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Encoding used for generated thumbnails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg { quality: u8 },
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg { .. } => "jpg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg { .. } => "image/jpeg",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    /// `png`, `jpeg` or `jpg`; JPEG defaults to quality 85.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg { quality: 85 }),
            other => Err(format!("unsupported thumbnail format `{}`", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThumbnailConfig {
    /// Edge length of the square bounding box, in pixels.
    pub max_dimension: u32,
    pub format: OutputFormat,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_dimension: 128,
            format: OutputFormat::Png,
        }
    }
}

#[derive(Debug)]
pub struct ThumbnailResult {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("malformed queue message: {0}")]
    MalformedMessage(String),
    #[error("cannot decode `{key}` as an image: {source}")]
    Decode {
        key: String,
        #[source]
        source: image::ImageError,
    },
    #[error("cannot encode thumbnail: {0}")]
    Encode(#[source] image::ImageError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("thumbnail task failed: {0}")]
    Task(String),
}

impl ProcessingError {
    /// Transient failures leave the message on the queue for redelivery;
    /// everything else goes to the dead-letter channel.
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessingError::Storage(err) => err.is_transient(),
            ProcessingError::Metadata(err) => matches!(err, MetadataError::Sqlx(_)),
            ProcessingError::Task(_) => true,
            ProcessingError::MalformedMessage(_)
            | ProcessingError::Decode { .. }
            | ProcessingError::Encode(_) => false,
        }
    }
}

/// What happened to a message that did not fail.
#[derive(Debug)]
pub enum ProcessOutcome {
    Generated(ImageRecord),
    /// Nothing to do; the message should still be acknowledged.
    Skipped { reason: String },
}

pub struct ThumbnailProcessor {
    config: ThumbnailConfig,
}

impl ThumbnailProcessor {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self { config }
    }

    /// Decode, resize and encode. Blocking; see `generate_async`.
    pub fn generate(&self, key: &str, original: &[u8]) -> Result<ThumbnailResult, ProcessingError> {
        let img = image::load_from_memory(original).map_err(|source| ProcessingError::Decode {
            key: key.to_string(),
            source,
        })?;

        let (orig_w, orig_h) = img.dimensions();
        let (width, height) = self.calculate_dimensions(orig_w, orig_h);
        debug!(key, orig_w, orig_h, width, height, "resizing");

        let resized = if (width, height) == (orig_w, orig_h) {
            img
        } else {
            img.resize_exact(width, height, FilterType::Triangle)
        };

        let data = self.encode(&resized)?;
        Ok(ThumbnailResult {
            data,
            width,
            height,
        })
    }

    pub async fn generate_async(
        self: Arc<Self>,
        key: String,
        original: Bytes,
    ) -> Result<ThumbnailResult, ProcessingError> {
        tokio::task::spawn_blocking(move || self.generate(&key, &original))
            .await
            .map_err(|e| ProcessingError::Task(e.to_string()))?
    }

    /// Fit `width`×`height` inside the bounding box, preserving aspect ratio.
    /// Images already inside the box keep their size.
    pub fn calculate_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let max_dim = self.config.max_dimension;
        if width <= max_dim && height <= max_dim {
            return (width, height);
        }

        let scale = |v: u32, long: u32| {
            ((f64::from(v) * f64::from(max_dim) / f64::from(long)).round() as u32).max(1)
        };
        if width >= height {
            (max_dim, scale(height, width))
        } else {
            (scale(width, height), max_dim)
        }
    }

    fn encode(&self, img: &DynamicImage) -> Result<Bytes, ProcessingError> {
        let mut buf = Vec::new();
        let mut cursor = Cursor::new(&mut buf);
        match self.config.format {
            OutputFormat::Png => img.write_to(&mut cursor, ImageOutputFormat::Png),
            // the JPEG encoder has no alpha channel
            OutputFormat::Jpeg { quality } => DynamicImage::ImageRgb8(img.to_rgb8())
                .write_to(&mut cursor, ImageOutputFormat::Jpeg(quality)),
        }
        .map_err(ProcessingError::Encode)?;
        Ok(Bytes::from(buf))
    }

    pub fn format(&self) -> OutputFormat {
        self.config.format
    }
}

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub thumbnail: ThumbnailConfig,
    /// Key prefix generated thumbnails are written under.
    pub thumbnail_prefix: String,
    /// Base of the public object URLs, e.g. `http://localhost:3000`.
    pub public_base_url: String,
    pub retry: RetryPolicy,
}

/// Consumes queue messages and produces thumbnails plus metadata records.
pub struct ThumbnailGenerator<S, M> {
    store: S,
    records: M,
    processor: Arc<ThumbnailProcessor>,
    config: GeneratorConfig,
}

impl<S: ObjectStore, M: RecordStore> ThumbnailGenerator<S, M> {
    pub fn new(store: S, records: M, config: GeneratorConfig) -> Self {
        let processor = Arc::new(ThumbnailProcessor::new(config.thumbnail.clone()));
        Self {
            store,
            records,
            processor,
            config,
        }
    }

    /// Deterministic thumbnail location for an image id.
    pub fn thumbnail_key(&self, id: &str) -> String {
        format!(
            "{}/{}.{}",
            self.config.thumbnail_prefix,
            id,
            self.processor.format().extension()
        )
    }

    /// Download URL for a thumbnail. Bucket and key segments are
    /// percent-encoded; `/` between key segments is kept.
    pub fn thumbnail_url(&self, bucket: &str, thumbnail_key: &str) -> String {
        let path = std::iter::once(bucket)
            .chain(thumbnail_key.split('/'))
            .map(|segment| utf8_percent_encode(segment, SEGMENT_SET).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/objects/{}",
            self.config.public_base_url.trim_end_matches('/'),
            path
        )
    }

    /// Handle one queue message end to end.
    pub async fn process(&self, message: &QueueMessage) -> Result<ProcessOutcome, ProcessingError> {
        let event = ObjectCreatedEvent::from_body(&message.body)
            .map_err(|e| ProcessingError::MalformedMessage(e.to_string()))?;
        let object = event.object_ref().ok_or_else(|| {
            ProcessingError::MalformedMessage("no ObjectCreated record in event".into())
        })?;
        let (bucket, key) = (object.bucket.as_str(), object.key.as_str());

        if is_thumbnail_key(&self.config.thumbnail_prefix, key) {
            return Ok(ProcessOutcome::Skipped {
                reason: format!("`{}` is a generated thumbnail", key),
            });
        }

        let store = &self.store;
        let original = match with_retry(&self.config.retry, "get_object", move || {
            store.get_object_bytes(bucket, key)
        })
        .await
        {
            Ok(data) => data,
            Err(err) if err.is_not_found() => {
                warn!(message_id = %message.message_id, bucket, key, "original is gone, skipping");
                return Ok(ProcessOutcome::Skipped {
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let thumbnail = self
            .processor
            .clone()
            .generate_async(key.to_string(), original)
            .await?;

        let id = image_id_from_key(key);
        let thumbnail_key = self.thumbnail_key(&id);
        let content_type = self.processor.format().content_type();
        let thumbnail_ref = thumbnail_key.as_str();
        let data = thumbnail.data.clone();
        with_retry(&self.config.retry, "put_thumbnail", move || {
            store.put_object_bytes(bucket, thumbnail_ref, content_type, data.clone())
        })
        .await?;

        let record = NewImageRecord {
            thumbnail_url: self.thumbnail_url(bucket, &thumbnail_key),
            thumbnail_key: thumbnail_key.clone(),
            source_bucket: bucket.to_string(),
            source_key: key.to_string(),
            width: thumbnail.width,
            height: thumbnail.height,
            id,
        };
        let records = &self.records;
        let record_ref = &record;
        let stored = with_retry(&self.config.retry, "upsert_record", move || {
            records.upsert_record(record_ref)
        })
        .await?;

        info!(
            message_id = %message.message_id,
            id = %stored.id,
            thumbnail_key = %stored.thumbnail_key,
            width = thumbnail.width,
            height = thumbnail.height,
            "thumbnail generated"
        );
        Ok(ProcessOutcome::Generated(stored))
    }
}
