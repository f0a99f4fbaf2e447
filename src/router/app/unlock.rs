use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use std::sync::Arc;

use crate::{data::model::Session, middleware::error_response, AppState};

#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error("You need to log in")]
    Unauthorized,
    #[error("That unlock code is not valid")]
    InvalidCode,
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

impl IntoResponse for UnlockError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            UnlockError::Unauthorized => {
                error_response(StatusCode::UNAUTHORIZED, "unauthorized", &message)
            }
            UnlockError::InvalidCode => {
                error_response(StatusCode::FORBIDDEN, "invalid_code", &message)
            }
            UnlockError::Store(err) => {
                error!(error = %err, "store failure while updating unlock state");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "An error occurred while processing your request",
                )
            }
        }
    }
}

#[derive(Serialize, Debug)]
pub struct UnlockStatus {
    unlocked: bool,
}

#[derive(Deserialize, Debug)]
pub struct UnlockAttempt {
    code: String,
}

pub async fn unlock_status(
    Extension(session): Extension<Option<Session>>,
) -> Result<Json<UnlockStatus>, UnlockError> {
    let session = session.ok_or(UnlockError::Unauthorized)?;
    Ok(Json(UnlockStatus {
        unlocked: session.unlocked,
    }))
}

#[axum::debug_handler]
pub async fn unlock(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Option<Session>>,
    Json(attempt): Json<UnlockAttempt>,
) -> Result<Json<UnlockStatus>, UnlockError> {
    let mut session = session.ok_or(UnlockError::Unauthorized)?;
    if !state.unlock_repo.is_valid(&attempt.code).await? {
        warn!(user_id = %session.user.id, "rejected unlock code");
        return Err(UnlockError::InvalidCode);
    }

    session.unlocked = true;
    state.session_repo.save_unlock(&session).await?;
    info!(user_id = %session.user.id, "session unlocked");

    Ok(Json(UnlockStatus { unlocked: true }))
}

pub async fn lock(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Option<Session>>,
) -> Result<Json<UnlockStatus>, UnlockError> {
    let mut session = session.ok_or(UnlockError::Unauthorized)?;
    session.unlocked = false;
    state.session_repo.save_unlock(&session).await?;

    Ok(Json(UnlockStatus { unlocked: false }))
}
