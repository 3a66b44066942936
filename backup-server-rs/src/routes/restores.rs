use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use backup_engine::StagingHandle;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_restores))
        .route("/{handle}", delete(discard_restore))
        .route("/{handle}/promote", post(promote_restore))
}

async fn list_restores(State(state): State<Arc<AppState>>) -> Json<Vec<StagingHandle>> {
    Json(state.engine.pending_restores())
}

async fn promote_restore(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<StatusCode, AppError> {
    let engine = state.engine.clone();
    let items = tokio::spawn(async move { engine.promote_restore(&handle).await })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    tracing::info!(items = ?items, "Restore promoted via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn discard_restore(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.discard_restore(&handle).await?;
    Ok(StatusCode::NO_CONTENT)
}
