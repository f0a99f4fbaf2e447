use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Extension, Path, Query, State,
    },
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::Deserialize;
use tokio_stream::{Stream, StreamExt};
use tracing::info;
use uuid::Uuid;

use std::sync::Arc;

use crate::{
    data::model::{Chat, Message, Session, UsageRecord, Visibility},
    pipeline::{ChatError, ChatRequest, ChatStreamEvent},
    AppState,
};

fn sse_event(event: ChatStreamEvent) -> Result<Event, axum::Error> {
    let name = match &event {
        ChatStreamEvent::Text { .. } => "text",
        ChatStreamEvent::Reasoning { .. } => "reasoning",
        ChatStreamEvent::Usage { .. } => "usage",
        ChatStreamEvent::Error { .. } => "error",
    };
    Event::default()
        .event(name)
        .json_data(&event)
        .map_err(axum::Error::new)
}

fn bad_request(rejection: impl std::fmt::Display) -> ChatError {
    ChatError::BadRequest(rejection.to_string())
}

async fn owned_chat(state: &AppState, session: &Session, chat_id: Uuid) -> Result<Chat, ChatError> {
    let chat = state
        .chat_repo
        .get_chat(chat_id)
        .await?
        .ok_or(ChatError::ChatNotFound)?;
    if !chat.is_owned_by(session.user.id) {
        return Err(ChatError::OwnershipViolation);
    }
    Ok(chat)
}

// Handlers that need a session check it before looking at the path, query or
// body, so a logged-out caller always gets a 401.

pub async fn chat_generate(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Option<Session>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ChatError> {
    if session.is_none() {
        return Err(ChatError::Unauthorized);
    }
    let Json(request) = payload.map_err(bad_request)?;

    let prepared = state.pipeline.prepare(session.as_ref(), request).await?;
    let events = state.pipeline.stream(prepared).map(sse_event);

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize, Debug)]
pub struct DeleteChat {
    id: Uuid,
}

#[axum::debug_handler]
pub async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Option<Session>>,
    params: Result<Query<DeleteChat>, QueryRejection>,
) -> Result<&'static str, ChatError> {
    let session = session.ok_or(ChatError::Unauthorized)?;
    let Query(params) = params.map_err(bad_request)?;

    let chat = owned_chat(&state, &session, params.id).await?;
    state.chat_repo.delete_chat(chat.id).await?;
    info!(chat_id = %chat.id, "chat deleted");

    Ok("Chat deleted")
}

#[axum::debug_handler]
pub async fn chat_messages(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Option<Session>>,
    chat_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Vec<Message>>, ChatError> {
    let Path(chat_id) = chat_id.map_err(bad_request)?;
    let chat = state
        .chat_repo
        .get_chat(chat_id)
        .await?
        .ok_or(ChatError::ChatNotFound)?;

    let viewer = session.as_ref().map(|s| s.user.id);
    if !chat.readable_by(viewer) {
        return Err(match viewer {
            Some(_) => ChatError::OwnershipViolation,
            None => ChatError::Unauthorized,
        });
    }

    Ok(Json(state.chat_repo.list_messages(chat.id).await?))
}

#[derive(Deserialize, Debug)]
pub struct VisibilityUpdate {
    visibility: Visibility,
}

#[axum::debug_handler]
pub async fn set_visibility(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Option<Session>>,
    chat_id: Result<Path<Uuid>, PathRejection>,
    update: Result<Json<VisibilityUpdate>, JsonRejection>,
) -> Result<Json<Chat>, ChatError> {
    let session = session.ok_or(ChatError::Unauthorized)?;
    let Path(chat_id) = chat_id.map_err(bad_request)?;
    let Json(update) = update.map_err(bad_request)?;

    let mut chat = owned_chat(&state, &session, chat_id).await?;
    state
        .chat_repo
        .set_visibility(chat.id, update.visibility)
        .await?;
    chat.visibility = update.visibility;

    Ok(Json(chat))
}

#[axum::debug_handler]
pub async fn chat_usage(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Option<Session>>,
    chat_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Vec<UsageRecord>>, ChatError> {
    let session = session.ok_or(ChatError::Unauthorized)?;
    let Path(chat_id) = chat_id.map_err(bad_request)?;

    let chat = owned_chat(&state, &session, chat_id).await?;
    Ok(Json(state.usage_repo.list_for_chat(chat.id).await?))
}

#[axum::debug_handler]
pub async fn history(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Option<Session>>,
) -> Result<Json<Vec<Chat>>, ChatError> {
    let session = session.ok_or(ChatError::Unauthorized)?;
    Ok(Json(state.chat_repo.get_all_chats(session.user.id).await?))
}
