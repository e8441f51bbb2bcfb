//! Queue consumer: pulls messages one at a time and decides, for every
//! attempt, whether to acknowledge, release or dead-letter it.

use crate::{
    models::queue_message::QueueMessage,
    services::{
        metadata_service::RecordStore,
        queue_service::{QueueResult, QueueService},
        storage_service::ObjectStore,
        thumbnail_service::{ProcessOutcome, ThumbnailGenerator},
    },
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Budget for one processing attempt. Exceeding it counts as transient.
    pub processing_timeout: Duration,
    /// How long a released message stays hidden before redelivery.
    pub retry_delay: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

/// Final decision for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Released,
    DeadLettered,
}

pub struct Worker<S, M> {
    id: usize,
    queue: QueueService,
    generator: Arc<ThumbnailGenerator<S, M>>,
    config: WorkerConfig,
}

impl<S, M> Worker<S, M>
where
    S: ObjectStore + 'static,
    M: RecordStore + 'static,
{
    pub fn new(
        id: usize,
        queue: QueueService,
        generator: Arc<ThumbnailGenerator<S, M>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            queue,
            generator,
            config,
        }
    }

    /// Poll until `shutdown` flips to `true`. The message in hand is always
    /// finished before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, "worker started");

        while !*shutdown.borrow() {
            match self.poll_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => error!(worker = self.id, error = %err, "queue unavailable"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker = self.id, "worker stopped");
    }

    /// Receive and handle at most one message.
    pub async fn poll_once(&self) -> QueueResult<Option<Disposition>> {
        match self.queue.receive().await? {
            Some(message) => {
                debug!(
                    worker = self.id,
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "received message"
                );
                let disposition = self.handle(&message).await?;
                Ok(Some(disposition))
            }
            None => Ok(None),
        }
    }

    async fn handle(
        &self,
        message: &QueueMessage,
    ) -> QueueResult<Disposition> {
        let attempt =
            tokio::time::timeout(self.config.processing_timeout, self.generator.process(message))
                .await;

        let disposition = match attempt {
            Ok(Ok(ProcessOutcome::Generated(record))) => {
                debug!(message_id = %message.message_id, id = %record.id, "acknowledging");
                self.ack(message).await?
            }
            Ok(Ok(ProcessOutcome::Skipped { reason })) => {
                warn!(message_id = %message.message_id, %reason, "skipped message");
                self.ack(message).await?
            }
            Ok(Err(err)) if err.is_transient() => {
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %err,
                    "transient failure, releasing for redelivery"
                );
                self.queue
                    .release(&message.receipt, self.config.retry_delay)
                    .await?;
                Disposition::Released
            }
            Ok(Err(err)) => {
                error!(
                    message_id = %message.message_id,
                    error = %err,
                    "permanent failure, dead-lettering"
                );
                self.queue
                    .dead_letter(&message.receipt, &err.to_string())
                    .await?;
                Disposition::DeadLettered
            }
            Err(_) => {
                warn!(
                    message_id = %message.message_id,
                    timeout = ?self.config.processing_timeout,
                    "processing timed out, releasing for redelivery"
                );
                self.queue
                    .release(&message.receipt, self.config.retry_delay)
                    .await?;
                Disposition::Released
            }
        };

        Ok(disposition)
    }

    async fn ack(
        &self,
        message: &QueueMessage,
    ) -> QueueResult<Disposition> {
        if !self.queue.ack(&message.receipt).await? {
            // lease expired and someone else owns the message now
            debug!(message_id = %message.message_id, "stale receipt on ack");
        }
        Ok(Disposition::Acked)
    }
}

/// Spawn `count` workers sharing one generator.
pub fn spawn_workers<S, M>(
    count: usize,
    queue: &QueueService,
    generator: Arc<ThumbnailGenerator<S, M>>,
    config: &WorkerConfig,
    shutdown: &watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>>
where
    S: ObjectStore + 'static,
    M: RecordStore + 'static,
{
    (0..count)
        .map(|id| {
            let worker = Worker::new(id, queue.clone(), generator.clone(), config.clone());
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{object::Object, queue_message::ObjectCreatedEvent},
        services::{
            metadata_service::MetadataService,
            queue_service::QueueConfig,
            storage_service::{StorageError, StorageService},
            thumbnail_service::tests::{fixture, generator_config},
        },
        test_support,
    };
    use async_trait::async_trait;
    use bytes::Bytes;

    fn worker_config(processing_timeout: Duration) -> WorkerConfig {
        WorkerConfig {
            processing_timeout,
            retry_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn queue_for(storage: &StorageService, max_receive_count: u32) -> QueueService {
        QueueService::new(
            storage.db.clone(),
            QueueConfig {
                visibility_timeout: Duration::from_secs(30),
                max_receive_count,
            },
        )
    }

    async fn enqueue_upload(queue: &QueueService, key: &str) {
        let body = ObjectCreatedEvent::put("photo-bucket", key, 0).to_body().unwrap();
        queue.enqueue(&body).await.unwrap();
    }

    fn worker(
        queue: &QueueService,
        storage: StorageService,
        metadata: MetadataService,
        timeout: Duration,
    ) -> Worker<StorageService, MetadataService> {
        let generator = Arc::new(ThumbnailGenerator::new(storage, metadata, generator_config()));
        Worker::new(0, queue.clone(), generator, worker_config(timeout))
    }

    #[tokio::test]
    async fn acks_successful_message() {
        let fx = fixture().await;
        upload(&fx.storage, "photo1.jpg", test_support::jpeg_bytes(500, 300)).await;
        let queue = queue_for(&fx.storage, 3);
        enqueue_upload(&queue, "photo1.jpg").await;
        let worker = worker(&queue, fx.storage.clone(), fx.metadata.clone(), Duration::from_secs(5));

        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Acked));
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert!(fx.metadata.get_record("photo1").await.unwrap().is_some());
        assert_eq!(worker.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_deliveries_leave_one_record() {
        let fx = fixture().await;
        upload(&fx.storage, "photo1.jpg", test_support::jpeg_bytes(500, 300)).await;
        let queue = queue_for(&fx.storage, 3);
        enqueue_upload(&queue, "photo1.jpg").await;
        enqueue_upload(&queue, "photo1.jpg").await;
        let worker = worker(&queue, fx.storage.clone(), fx.metadata.clone(), Duration::from_secs(5));

        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Acked));
        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Acked));

        let records = fx.metadata.list_records(None, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "photo1");
    }

    #[tokio::test]
    async fn corrupt_image_is_dead_lettered_without_record() {
        let fx = fixture().await;
        upload(&fx.storage, "fake.jpg", Bytes::from_static(b"definitely not a jpeg")).await;
        let queue = queue_for(&fx.storage, 3);
        enqueue_upload(&queue, "fake.jpg").await;
        let worker = worker(&queue, fx.storage.clone(), fx.metadata.clone(), Duration::from_secs(5));

        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::DeadLettered));
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.list_dead_letters().await.unwrap().len(), 1);
        assert_eq!(fx.metadata.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_original_is_acked_not_dead_lettered() {
        let fx = fixture().await;
        let queue = queue_for(&fx.storage, 3);
        enqueue_upload(&queue, "deleted.jpg").await;
        let worker = worker(&queue, fx.storage.clone(), fx.metadata.clone(), Duration::from_secs(5));

        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Acked));
        assert!(queue.list_dead_letters().await.unwrap().is_empty());
        assert_eq!(fx.metadata.count().await.unwrap(), 0);
    }

    /// Never answers within any reasonable budget.
    struct StalledStore;

    #[async_trait]
    impl ObjectStore for StalledStore {
        async fn get_object_bytes(&self, _bucket: &str, _key: &str) -> Result<Bytes, StorageError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Bytes::new())
        }

        async fn put_object_bytes(
            &self,
            _bucket: &str,
            _key: &str,
            _content_type: &str,
            _data: Bytes,
        ) -> Result<Object, StorageError> {
            Err(StorageError::InvalidObjectKey)
        }
    }

    #[tokio::test]
    async fn timeout_releases_then_dead_letters_after_max_receives() {
        let fx = fixture().await;
        let queue = queue_for(&fx.storage, 2);
        enqueue_upload(&queue, "slow.jpg").await;
        let generator = Arc::new(ThumbnailGenerator::new(
            StalledStore,
            fx.metadata.clone(),
            generator_config(),
        ));
        let worker = Worker::new(0, queue.clone(), generator, worker_config(Duration::from_millis(20)));

        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Released));
        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Released));
        // third receive exceeds the limit and is diverted before delivery
        assert_eq!(worker.poll_once().await.unwrap(), None);

        let dead = queue.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].receive_count, 3);
    }

    #[tokio::test]
    async fn run_drains_queue_and_stops_on_shutdown() {
        let fx = fixture().await;
        for key in ["a.jpg", "b.jpg"] {
            upload(&fx.storage, key, test_support::jpeg_bytes(40, 30)).await;
        }
        let queue = queue_for(&fx.storage, 3);
        enqueue_upload(&queue, "a.jpg").await;
        enqueue_upload(&queue, "b.jpg").await;

        let (tx, rx) = watch::channel(false);
        let worker = worker(&queue, fx.storage.clone(), fx.metadata.clone(), Duration::from_secs(5));
        let handle = tokio::spawn(worker.run(rx));

        for _ in 0..200 {
            if fx.metadata.count().await.unwrap() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(fx.metadata.count().await.unwrap(), 2);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    async fn upload(storage: &StorageService, key: &str, data: Bytes) {
        storage
            .put_object_bytes("photo-bucket", key, "image/jpeg", data)
            .await
            .unwrap();
    }
}
