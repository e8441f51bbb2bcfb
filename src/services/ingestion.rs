//! Turns object writes into work-queue messages.

use crate::{
    models::{object::Object, queue_message::ObjectCreatedEvent},
    services::storage_service::{StorageResult, StorageService},
};
use bytes::Bytes;
use futures::Stream;
use std::io;
use tracing::{debug, info};

/// True when `key` sits under the thumbnail prefix. Such objects were
/// written by the generator and must not be fed back into it.
pub fn is_thumbnail_key(thumbnail_prefix: &str, key: &str) -> bool {
    key.strip_prefix(thumbnail_prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Clone)]
pub struct IngestionTrigger {
    storage: StorageService,
    thumbnail_prefix: String,
}

impl IngestionTrigger {
    pub fn new(storage: StorageService, thumbnail_prefix: impl Into<String>) -> Self {
        Self {
            storage,
            thumbnail_prefix: thumbnail_prefix.into(),
        }
    }

    /// Store an uploaded object and enqueue exactly one message for it.
    ///
    /// The object row and its message commit in one transaction: a failed
    /// enqueue leaves no object behind. Returns the message id, or `None`
    /// when the object is a generated thumbnail.
    pub async fn on_object_created<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<(Object, Option<String>)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let prefix = self.thumbnail_prefix.as_str();
        let (object, message_id) = self
            .storage
            .upload_with_outbox(bucket, key, content_type, stream, |object| {
                if is_thumbnail_key(prefix, &object.key) {
                    return Ok(None);
                }
                let size = u64::try_from(object.size_bytes).unwrap_or(0);
                ObjectCreatedEvent::put(bucket, &object.key, size)
                    .to_body()
                    .map(Some)
                    .map_err(Into::into)
            })
            .await?;

        match &message_id {
            Some(id) => info!(bucket, key, message_id = %id, "queued thumbnail job"),
            None => debug!(bucket, key, "ignoring thumbnail write"),
        }
        Ok((object, message_id))
    }
}
