//! Shared fixtures for unit tests.

use crate::{db, services::storage_service::StorageService};
use bytes::Bytes;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::io::Cursor;
use tempfile::TempDir;

/// A migrated in-memory database. One connection, kept alive for the whole
/// test, because every `sqlite::memory:` connection is its own database.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    db::run_migrations(&pool).await.expect("apply schema");
    pool
}

/// Storage rooted in a fresh temp directory. Keep the `TempDir` alive for
/// the duration of the test.
pub async fn storage() -> (StorageService, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let pool = memory_pool().await;
    (StorageService::new(pool, dir.path()), dir)
}

/// A solid-colour JPEG of the given size.
pub fn jpeg_bytes(width: u32, height: u32) -> Bytes {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 80, 40])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Jpeg(90))
        .expect("encode jpeg");
    Bytes::from(buf)
}
