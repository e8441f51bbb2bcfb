pub mod ingestion;
pub mod listing_service;
pub mod metadata_service;
pub mod queue_service;
pub mod retry;
pub mod storage_service;
pub mod thumbnail_service;
