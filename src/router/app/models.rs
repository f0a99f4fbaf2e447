use axum::{extract::State, Json};

use std::sync::Arc;

use crate::{data::model::AiModel, pipeline::ChatError, AppState};

/// Active models for the picker. Endpoints and keys are never serialized.
pub async fn models(State(state): State<Arc<AppState>>) -> Result<Json<Vec<AiModel>>, ChatError> {
    Ok(Json(state.model_repo.list_active().await?))
}
