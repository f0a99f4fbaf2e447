use axum::{
    routing::{get, patch, post},
    Router,
};

use std::sync::Arc;

use crate::AppState;

mod chat;
use chat::{chat_generate, chat_messages, chat_usage, delete_chat, history, set_visibility};
mod models;
use models::models;
mod unlock;
use unlock::{lock, unlock, unlock_status};
mod error;
use error::fallback;

use crate::middleware::auth;

pub fn app_router(state: Arc<AppState>) -> Router {
    // POST /chat authenticates inside the pipeline and public chats are
    // readable anonymously, so only history and unlock sit behind `auth`.
    let chat_router = Router::new()
        .route("/", post(chat_generate).delete(delete_chat))
        .route("/:id/messages", get(chat_messages))
        .route("/:id/visibility", patch(set_visibility))
        .route("/:id/usage", get(chat_usage));

    let history_router = Router::new()
        .route("/", get(history))
        .layer(axum::middleware::from_fn(auth));

    let unlock_router = Router::new()
        .route("/", get(unlock_status).post(unlock).delete(lock))
        .layer(axum::middleware::from_fn(auth));

    Router::new()
        .route("/models", get(models))
        .nest("/chat", chat_router)
        .nest("/history", history_router)
        .nest("/unlock", unlock_router)
        .fallback(fallback)
        .with_state(state)
}
