//! Represents a logical bucket, the top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket holding uploaded originals and generated thumbnails.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Internal identifier used as the foreign key for objects.
    pub id: Uuid,

    /// Bucket name (DNS-style naming rules).
    pub name: String,

    /// Region the bucket was created in (e.g. "us-west-2").
    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
