use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::{fs, net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod test_support;
mod worker;

use services::{
    ingestion::IngestionTrigger,
    listing_service::ListingService,
    metadata_service::MetadataService,
    queue_service::QueueService,
    retry::RetryPolicy,
    storage_service::StorageService,
    thumbnail_service::{GeneratorConfig, ThumbnailConfig, ThumbnailGenerator},
};
use state::AppState;
use worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting thumbnail-service with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir).await?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }
    ensure_db_parent(&cfg.database_url).await?;

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;
    db::run_migrations(&db).await?;

    let metadata = MetadataService::new(db.clone(), cfg.table_name.clone())
        .context("invalid metadata table name")?;
    metadata.ensure_table().await?;
    tracing::info!("Metadata table `{}` ready", metadata.table_name());

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone());
    storage
        .ensure_bucket(&cfg.bucket, &cfg.region)
        .await
        .with_context(|| format!("creating bucket `{}`", cfg.bucket))?;

    let queue = QueueService::new(db.clone(), cfg.queue_config());
    let retry = RetryPolicy::default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {}", err);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // --- Workers ---
    let workers = if cfg.role.runs_workers() {
        let generator = Arc::new(ThumbnailGenerator::new(
            storage.clone(),
            metadata.clone(),
            GeneratorConfig {
                thumbnail: ThumbnailConfig {
                    max_dimension: cfg.thumbnail_size,
                    format: cfg.thumbnail_format,
                },
                thumbnail_prefix: cfg.thumbnail_prefix.clone(),
                public_base_url: cfg.public_base_url.clone(),
                retry: retry.clone(),
            },
        ));
        let worker_config = WorkerConfig {
            processing_timeout: cfg.processing_timeout,
            retry_delay: cfg.retry_delay,
            poll_interval: cfg.poll_interval,
        };
        tracing::info!("Starting {} queue workers", cfg.worker_count);
        worker::spawn_workers(
            cfg.worker_count,
            &queue,
            generator,
            &worker_config,
            &shutdown_rx,
        )
    } else {
        Vec::new()
    };

    // --- HTTP API ---
    if cfg.role.runs_api() {
        let state = AppState {
            ingestion: IngestionTrigger::new(storage.clone(), cfg.thumbnail_prefix.clone()),
            storage,
            listing: ListingService::new(metadata, retry),
            queue,
        };
        let app: Router = routes::routes::routes().with_state(state);
        serve(&cfg, app, shutdown_rx.clone()).await?;
    } else {
        wait_for_shutdown(shutdown_rx.clone()).await;
    }

    for handle in workers {
        if let Err(err) = handle.await {
            tracing::error!("worker task failed: {}", err);
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn serve(cfg: &config::AppConfig, app: Router, shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await?;
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Create the directory holding a file-backed SQLite database.
async fn ensure_db_parent(database_url: &str) -> Result<()> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if db_path.starts_with(":memory:") || db_path.is_empty() {
        return Ok(());
    }

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}
