//! src/services/metadata_service.rs
//!
//! MetadataService — the key-value table of processed images, keyed by
//! image id. The table name is configurable, so statements are built with
//! the validated name interpolated and values bound as parameters.

use crate::{
    models::image_record::{ImageRecord, NewImageRecord},
    services::retry::{Retryable, is_transient_sqlx},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("table name `{0}` is invalid: use letters, digits and underscores")]
    InvalidTableName(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl Retryable for MetadataError {
    fn is_retryable(&self) -> bool {
        match self {
            MetadataError::Sqlx(err) => is_transient_sqlx(err),
            MetadataError::InvalidTableName(_) => false,
        }
    }
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Write access to the metadata table, as needed by the thumbnail generator.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_record(&self, record: &NewImageRecord) -> MetadataResult<ImageRecord>;
}

const RECORD_COLUMNS: &str = "id, thumbnail_url, thumbnail_key, source_bucket, source_key, \
                              width, height, created_at, updated_at";

#[derive(Clone)]
pub struct MetadataService {
    db: SqlitePool,
    table: String,
}

impl MetadataService {
    pub fn new(db: SqlitePool, table: impl Into<String>) -> MetadataResult<Self> {
        let table = table.into();
        if !is_valid_table_name(&table) {
            return Err(MetadataError::InvalidTableName(table));
        }
        Ok(Self { db, table })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Create the table if it does not exist yet.
    pub async fn ensure_table(&self) -> MetadataResult<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                id TEXT PRIMARY KEY,
                thumbnail_url TEXT NOT NULL,
                thumbnail_key TEXT NOT NULL,
                source_bucket TEXT NOT NULL,
                source_key TEXT NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            self.table
        );
        sqlx::query(&ddl).execute(&self.db).await?;
        Ok(())
    }

    /// Fetch one record by id.
    pub async fn get_record(&self, id: &str) -> MetadataResult<Option<ImageRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM \"{}\" WHERE id = ?",
            self.table
        );
        let record = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(record)
    }

    /// Records in ascending id order, strictly after `after` when given.
    /// `limit = None` returns everything that remains.
    pub async fn list_records(
        &self,
        after: Option<&str>,
        limit: Option<u32>,
    ) -> MetadataResult<Vec<ImageRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM \"{}\"",
            self.table
        ));

        if let Some(after) = after {
            builder.push(" WHERE id > ");
            builder.push_bind(after.to_string());
        }

        builder.push(" ORDER BY id ASC");

        if let Some(limit) = limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::from(limit));
        }

        let rows: Vec<ImageRecord> = builder.build_query_as().fetch_all(&self.db).await?;
        Ok(rows)
    }

    pub async fn count(&self) -> MetadataResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", self.table);
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl RecordStore for MetadataService {
    /// Insert or overwrite the record for `record.id`. `created_at` survives
    /// overwrites.
    ///
    /// Ids drop the file extension, so `photo1.jpg` and `photo1.png` share a
    /// record and the later write wins. That replacement is logged.
    async fn upsert_record(&self, record: &NewImageRecord) -> MetadataResult<ImageRecord> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let previous_source = sqlx::query_scalar::<_, String>(&format!(
            "SELECT source_key FROM \"{}\" WHERE id = ?",
            self.table
        ))
        .bind(&record.id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(previous) = previous_source.filter(|prev| *prev != record.source_key) {
            warn!(
                id = %record.id,
                previous_source = %previous,
                source_key = %record.source_key,
                "image id now points at a different original"
            );
        }

        let sql = format!(
            r#"
            INSERT INTO "{table}" ({RECORD_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                thumbnail_url = excluded.thumbnail_url,
                thumbnail_key = excluded.thumbnail_key,
                source_bucket = excluded.source_bucket,
                source_key = excluded.source_key,
                width = excluded.width,
                height = excluded.height,
                updated_at = excluded.updated_at
            RETURNING {RECORD_COLUMNS}
            "#,
            table = self.table
        );

        let stored = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(&record.id)
            .bind(&record.thumbnail_url)
            .bind(&record.thumbnail_key)
            .bind(&record.source_bucket)
            .bind(&record.source_key)
            .bind(i64::from(record.width))
            .bind(i64::from(record.height))
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(stored)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, at most 64 characters.
fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
