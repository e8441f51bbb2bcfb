//! Work-queue envelopes and the object-created event they carry.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A message leased from the work queue.
///
/// `receipt` identifies this particular delivery. It changes every time the
/// message is received, so a worker whose lease expired cannot acknowledge a
/// message that was since handed to someone else.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
    /// Number of times this message has been delivered, this delivery included.
    pub receive_count: i64,
    /// Enqueue time, unix milliseconds.
    pub sent_at: i64,
}

/// A message parked in the dead-letter channel for manual inspection.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub receive_count: i64,
    pub reason: String,
    pub sent_at: i64,
    pub dead_lettered_at: i64,
}

/// S3-style object-created notification.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectCreatedEvent {
    #[serde(rename = "Records")]
    pub records: Vec<EventRecord>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventRecord {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct S3Object {
    pub key: String,
    pub size: u64,
}

/// Bucket/key pair identifying the original image of an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectCreatedEvent {
    pub fn put(bucket: &str, key: &str, size: u64) -> Self {
        Self {
            records: vec![EventRecord {
                event_name: "ObjectCreated:Put".into(),
                s3: S3Entity {
                    bucket: S3Bucket {
                        name: bucket.to_string(),
                    },
                    object: S3Object {
                        key: key.to_string(),
                        size,
                    },
                },
            }],
        }
    }

    pub fn to_body(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_body(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }

    /// The object referenced by the first `ObjectCreated:*` record, if any.
    pub fn object_ref(&self) -> Option<ObjectRef> {
        self.records
            .iter()
            .find(|r| r.event_name.starts_with("ObjectCreated:"))
            .map(|r| ObjectRef {
                bucket: r.s3.bucket.name.clone(),
                key: r.s3.object.key.clone(),
            })
    }
}
