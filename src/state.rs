use crate::services::{
    ingestion::IngestionTrigger, listing_service::ListingService, queue_service::QueueService,
    storage_service::StorageService,
};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub queue: QueueService,
    pub listing: ListingService,
    pub ingestion: IngestionTrigger,
}
