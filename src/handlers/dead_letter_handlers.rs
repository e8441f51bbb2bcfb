//! Operator endpoints for the dead-letter channel.

use crate::{errors::AppError, models::queue_message::DeadLetter, state::AppState};
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RedriveResponse {
    pub redriven: u64,
}

/// `GET /dead-letters`
pub async fn list_dead_letters(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    Ok(Json(state.queue.list_dead_letters().await?))
}

/// `POST /dead-letters/redrive`: requeue everything with a fresh receive count.
pub async fn redrive_dead_letters(
    State(state): State<AppState>,
) -> Result<Json<RedriveResponse>, AppError> {
    let redriven = state.queue.redrive_dead_letters().await?;
    tracing::info!(redriven, "redrove dead letters");
    Ok(Json(RedriveResponse { redriven }))
}
