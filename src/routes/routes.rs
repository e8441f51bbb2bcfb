//! Route table.
//!
//! ## Structure
//! - **Catalogue**
//!   - `GET    /images` — every image id with its thumbnail URL (`?limit=&token=`)
//!   - `GET    /images/{*id}` — one image with its thumbnail details
//!
//! - **Objects** (uploads here feed the thumbnail pipeline)
//!   - `PUT    /objects/{bucket}` — create bucket
//!   - `PUT    /objects/{bucket}/{*key}` — upload object
//!   - `GET    /objects/{bucket}/{*key}` — download object
//!   - `HEAD   /objects/{bucket}/{*key}` — retrieve metadata only
//!   - `DELETE /objects/{bucket}/{*key}` — delete object
//!
//! - **Dead letters**
//!   - `GET    /dead-letters` — messages that exhausted their deliveries
//!   - `POST   /dead-letters/redrive` — put them back on the queue
//!
//! The wildcard `*key` allows nested keys like `thumbnails/photo1.png`.

use crate::{
    handlers::{
        dead_letter_handlers::{list_dead_letters, redrive_dead_letters},
        health_handlers::{healthz, readyz},
        image_handlers::{get_image, list_images},
        object_handlers::{create_bucket, delete_object, get_object, head_object, upload_object},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router. State is attached by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/images", get(list_images))
        .route("/images/{*id}", get(get_image))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/redrive", post(redrive_dead_letters))
        .route(
            "/objects/{bucket}/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        .route("/objects/{bucket}", put(create_bucket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::image_handlers::{ImageView, NEXT_PAGE_TOKEN},
        models::image_record::NewImageRecord,
        services::{
            ingestion::IngestionTrigger,
            listing_service::ListingService,
            metadata_service::{MetadataService, RecordStore},
            queue_service::{QueueConfig, QueueService},
            retry::RetryPolicy,
            storage_service::StorageService,
            thumbnail_service::{
                ThumbnailGenerator,
                tests::{Fixture, fixture, generator_config},
            },
        },
        test_support,
        worker::{Disposition, Worker, WorkerConfig},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        queue: QueueService,
        storage: StorageService,
        metadata: MetadataService,
        _fixture: Fixture,
    }

    async fn app() -> TestApp {
        let fx = fixture().await;
        let queue = QueueService::new(fx.storage.db.clone(), QueueConfig::default());
        let state = AppState {
            storage: fx.storage.clone(),
            queue: queue.clone(),
            listing: ListingService::new(fx.metadata.clone(), RetryPolicy::none()),
            ingestion: IngestionTrigger::new(fx.storage.clone(), "thumbnails"),
        };
        TestApp {
            router: routes().with_state(state),
            queue,
            storage: fx.storage.clone(),
            metadata: fx.metadata.clone(),
            _fixture: fx,
        }
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Body) -> Response {
        router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn images(router: &Router, uri: &str) -> (Response, Vec<ImageView>) {
        let response = send(router, Method::GET, uri, Body::empty()).await;
        let (parts, body) = response.into_parts();
        let bytes = to_bytes(body, usize::MAX).await.unwrap();
        let items = serde_json::from_slice(&bytes).unwrap_or_default();
        (Response::from_parts(parts, Body::empty()), items)
    }

    async fn insert_record(metadata: &MetadataService, id: &str) {
        metadata
            .upsert_record(&NewImageRecord {
                id: id.into(),
                thumbnail_url: format!(
                    "http://localhost:3000/objects/photo-bucket/thumbnails/{}.png",
                    id
                ),
                thumbnail_key: format!("thumbnails/{}.png", id),
                source_bucket: "photo-bucket".into(),
                source_key: format!("{}.jpg", id),
                width: 128,
                height: 77,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let app = app().await;
        let live = send(&app.router, Method::GET, "/healthz", Body::empty()).await;
        assert_eq!(live.status(), StatusCode::OK);

        let ready = send(&app.router, Method::GET, "/readyz", Body::empty()).await;
        assert_eq!(ready.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(ready).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue_depth"], 0);
    }

    #[tokio::test]
    async fn empty_catalogue_is_an_empty_array() {
        let app = app().await;
        let response = send(&app.router, Method::GET, "/images", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"[]");
    }

    #[tokio::test]
    async fn catalogue_uses_camel_case_fields() {
        let app = app().await;
        insert_record(&app.metadata, "photo1").await;

        let response = send(&app.router, Method::GET, "/images", Body::empty()).await;
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(
            body,
            serde_json::json!([{
                "id": "photo1",
                "thumbnailUrl": "http://localhost:3000/objects/photo-bucket/thumbnails/photo1.png"
            }])
        );
    }

    #[tokio::test]
    async fn pages_through_catalogue_with_token_header() {
        let app = app().await;
        for id in ["a", "b", "c"] {
            insert_record(&app.metadata, id).await;
        }

        let (first, items) = images(&app.router, "/images?limit=2").await;
        assert_eq!(
            items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        let token = first
            .headers()
            .get(NEXT_PAGE_TOKEN)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let (last, items) = images(&app.router, &format!("/images?limit=2&token={}", token)).await;
        assert_eq!(
            items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            ["c"]
        );
        assert!(last.headers().get(NEXT_PAGE_TOKEN).is_none());
    }

    #[tokio::test]
    async fn single_image_lookup() {
        let app = app().await;
        insert_record(&app.metadata, "albums/photo1").await;

        let found = send(&app.router, Method::GET, "/images/albums/photo1", Body::empty()).await;
        assert_eq!(found.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(found).await).unwrap();
        assert_eq!(body["sourceKey"], "albums/photo1.jpg");
        assert_eq!(body["width"], 128);

        let missing = send(&app.router, Method::GET, "/images/nope", Body::empty()).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let app = app().await;
        let response = send(&app.router, Method::GET, "/images?token=%21%21", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_enqueues_one_message() {
        let app = app().await;
        let response = send(
            &app.router,
            Method::PUT,
            "/objects/photo-bucket/photo1.jpg",
            Body::from(test_support::jpeg_bytes(8, 8)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("etag").is_some());
        assert!(response.headers().get("x-message-id").is_some());
        assert_eq!(app.queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn thumbnail_upload_does_not_enqueue() {
        let app = app().await;
        let response = send(
            &app.router,
            Method::PUT,
            "/objects/photo-bucket/thumbnails/photo1.png",
            Body::from("png"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-message-id").is_none());
        assert_eq!(app.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upload_to_unknown_bucket_is_not_found() {
        let app = app().await;
        let response = send(
            &app.router,
            Method::PUT,
            "/objects/nope-bucket/photo1.jpg",
            Body::from("x"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(app.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn object_round_trip_and_delete() {
        let app = app().await;
        send(
            &app.router,
            Method::PUT,
            "/objects/photo-bucket/notes/a.txt",
            Body::from("hello"),
        )
        .await;

        let head = send(&app.router, Method::HEAD, "/objects/photo-bucket/notes/a.txt", Body::empty()).await;
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(head.headers()["content-length"], "5");

        let get = send(&app.router, Method::GET, "/objects/photo-bucket/notes/a.txt", Body::empty()).await;
        assert_eq!(body_bytes(get).await, b"hello");

        let delete = send(&app.router, Method::DELETE, "/objects/photo-bucket/notes/a.txt", Body::empty()).await;
        assert_eq!(delete.status(), StatusCode::NO_CONTENT);

        let gone = send(&app.router, Method::GET, "/objects/photo-bucket/notes/a.txt", Body::empty()).await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_bucket_is_idempotent() {
        let app = app().await;
        for _ in 0..2 {
            let response = send(&app.router, Method::PUT, "/objects/other-bucket", Body::empty()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = send(
            &app.router,
            Method::PUT,
            "/objects/photo-bucket/x.jpg",
            Body::from("x"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dead_letters_can_be_listed_and_redriven() {
        let app = app().await;
        app.queue.enqueue("{}").await.unwrap();
        let msg = app.queue.receive().await.unwrap().unwrap();
        app.queue.dead_letter(&msg.receipt, "malformed").await.unwrap();

        let list = send(&app.router, Method::GET, "/dead-letters", Body::empty()).await;
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(list).await).unwrap();
        assert_eq!(body[0]["reason"], "malformed");

        let redrive = send(&app.router, Method::POST, "/dead-letters/redrive", Body::empty()).await;
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(redrive).await).unwrap();
        assert_eq!(body["redriven"], 1);
        assert_eq!(app.queue.depth().await.unwrap(), 1);
    }

    fn worker_for(app: &TestApp) -> Worker<StorageService, MetadataService> {
        let generator = Arc::new(ThumbnailGenerator::new(
            app.storage.clone(),
            app.metadata.clone(),
            generator_config(),
        ));
        Worker::new(
            0,
            app.queue.clone(),
            generator,
            WorkerConfig {
                processing_timeout: Duration::from_secs(5),
                retry_delay: Duration::ZERO,
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn upload_during_queue_outage_is_not_stored() {
        let app = app().await;
        sqlx::query("ALTER TABLE queue_messages RENAME TO queue_messages_offline")
            .execute(&app.storage.db)
            .await
            .unwrap();

        let response = send(
            &app.router,
            Method::PUT,
            "/objects/photo-bucket/photo1.jpg",
            Body::from(test_support::jpeg_bytes(8, 8)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        sqlx::query("ALTER TABLE queue_messages_offline RENAME TO queue_messages")
            .execute(&app.storage.db)
            .await
            .unwrap();

        let head = send(&app.router, Method::HEAD, "/objects/photo-bucket/photo1.jpg", Body::empty()).await;
        assert_eq!(head.status(), StatusCode::NOT_FOUND);
        assert_eq!(app.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn thumbnail_url_resolves_for_reserved_characters() {
        let app = app().await;
        let upload = send(
            &app.router,
            Method::PUT,
            "/objects/photo-bucket/IMG%200001%3F%23.jpg",
            Body::from(test_support::jpeg_bytes(500, 300)),
        )
        .await;
        assert_eq!(upload.status(), StatusCode::OK);
        assert_eq!(worker_for(&app).poll_once().await.unwrap(), Some(Disposition::Acked));

        let (_, items) = images(&app.router, "/images").await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "IMG 0001?#");
        let path = items[0]
            .thumbnail_url
            .strip_prefix("http://localhost:3000")
            .unwrap()
            .to_string();
        assert_eq!(path, "/objects/photo-bucket/thumbnails/IMG%200001%3F%23.png");

        let thumb = send(&app.router, Method::GET, &path, Body::empty()).await;
        assert_eq!(thumb.status(), StatusCode::OK);
        let decoded = image::load_from_memory(&body_bytes(thumb).await).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (128, 77));
    }

    #[tokio::test]
    async fn upload_flows_through_to_catalogue() {
        let app = app().await;
        send(
            &app.router,
            Method::PUT,
            "/objects/photo-bucket/photo1.jpg",
            Body::from(test_support::jpeg_bytes(500, 300)),
        )
        .await;

        assert_eq!(worker_for(&app).poll_once().await.unwrap(), Some(Disposition::Acked));

        let (_, items) = images(&app.router, "/images").await;
        assert_eq!(
            items,
            vec![ImageView {
                id: "photo1".into(),
                thumbnail_url: "http://localhost:3000/objects/photo-bucket/thumbnails/photo1.png"
                    .into(),
            }]
        );

        let thumb = send(
            &app.router,
            Method::GET,
            "/objects/photo-bucket/thumbnails/photo1.png",
            Body::empty(),
        )
        .await;
        assert_eq!(thumb.status(), StatusCode::OK);
        let decoded = image::load_from_memory(&body_bytes(thumb).await).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (128, 77));
        assert_eq!(app.queue.depth().await.unwrap(), 0);
    }
}
