//! Core data models for the thumbnail pipeline.
//!
//! Buckets and objects describe the local object store, image records are the
//! rows of the metadata table, and queue messages carry object-created events
//! from ingestion to the thumbnail workers. Row types map to SQLite via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod bucket;
pub mod image_record;
pub mod object;
pub mod queue_message;
