use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::{
    BackupCategory, BackupManifest, BackupStats, BackupSummary, StagingHandle, ValidationReport,
};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/stats", get(get_stats))
        .route("/{id}", get(get_backup).delete(delete_backup))
        .route("/{id}/verify", post(verify_backup))
        .route("/{id}/restore", post(restore_backup))
}

#[derive(Deserialize)]
pub struct CreateBackupRequest {
    pub category: BackupCategory,
    pub label: Option<String>,
}

#[derive(Deserialize)]
pub struct BackupsQuery {
    pub category: Option<BackupCategory>,
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBackupRequest>,
) -> Result<(StatusCode, Json<BackupSummary>), AppError> {
    // Runs detached so a dropped connection does not abort the backup halfway
    let engine = state.engine.clone();
    let summary = tokio::spawn(async move {
        engine.create_backup(body.category, body.label.as_deref()).await
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    tracing::info!(
        backup_id = %summary.backup_id,
        category = %summary.category,
        "Backup created via API"
    );
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BackupsQuery>,
) -> Result<Json<Vec<BackupSummary>>, AppError> {
    Ok(Json(state.engine.list_backups(query.category).await?))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<BackupStats>, AppError> {
    Ok(Json(state.engine.get_backup_stats().await?))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupManifest>, AppError> {
    Ok(Json(state.engine.get_backup(&id).await?))
}

async fn verify_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ValidationReport>, AppError> {
    Ok(Json(state.engine.verify_backup(&id).await?))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_backup(&id).await?;
    tracing::info!(backup_id = %id, "Backup deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StagingHandle>), AppError> {
    let engine = state.engine.clone();
    let handle = tokio::spawn(async move { engine.restore_backup(&id).await })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok((StatusCode::CREATED, Json(handle)))
}
