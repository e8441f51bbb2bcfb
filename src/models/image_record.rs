//! Rows of the metadata table: one per successfully generated thumbnail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A processed image and the location of its thumbnail.
///
/// A record is only written after the thumbnail itself has been persisted,
/// but the two writes are not atomic: a thumbnail may briefly exist without
/// its record.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ImageRecord {
    /// Identifier derived from the original object key (extension stripped).
    pub id: String,

    /// Resolvable URL of the thumbnail.
    pub thumbnail_url: String,

    /// Key of the thumbnail inside `source_bucket`.
    pub thumbnail_key: String,

    pub source_bucket: String,
    pub source_key: String,

    pub width: i64,
    pub height: i64,

    /// First time this id was processed.
    pub created_at: DateTime<Utc>,

    /// Last time this id was (re)processed.
    pub updated_at: DateTime<Utc>,
}

/// Values written by the generator. Timestamps are assigned by the table.
#[derive(Clone, Debug)]
pub struct NewImageRecord {
    pub id: String,
    pub thumbnail_url: String,
    pub thumbnail_key: String,
    pub source_bucket: String,
    pub source_key: String,
    pub width: u32,
    pub height: u32,
}

/// Derive the record id from an object key by dropping the file extension
/// of the final path segment. `photo1.jpg` becomes `photo1`, `albums/a.png`
/// becomes `albums/a`, and keys without an extension are returned unchanged.
pub fn image_id_from_key(key: &str) -> String {
    let (dir, file) = match key.rfind('/') {
        Some(pos) => key.split_at(pos + 1),
        None => ("", key),
    };
    let stem = match file.rfind('.') {
        Some(0) | None => file,
        Some(pos) => &file[..pos],
    };
    format!("{dir}{stem}")
}
