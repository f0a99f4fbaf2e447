use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::{middleware::error_response, pipeline::ChatError};

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            ChatError::Unauthorized | ChatError::OwnershipViolation => {
                error_response(StatusCode::UNAUTHORIZED, "unauthorized", &message)
            }
            ChatError::BadRequest(_) => {
                error_response(StatusCode::BAD_REQUEST, "bad_request", &message)
            }
            ChatError::ModelNotFound => {
                error_response(StatusCode::NOT_FOUND, "model_not_found", &message)
            }
            ChatError::ChatNotFound => {
                error_response(StatusCode::NOT_FOUND, "chat_not_found", &message)
            }
            ChatError::Store(err) => {
                error!(error = %err, "store failure while handling chat request");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "An error occurred while processing your request",
                )
            }
        }
    }
}

pub async fn fallback() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "Not found")
}
