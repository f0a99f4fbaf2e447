use axum::{
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use tower_cookies::Cookies;
use tracing::error;

use std::sync::Arc;

use crate::{data::model::Session, AppState};

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({"error": code, "message": message}))).into_response()
}

fn bearer_token<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

/// Resolves the caller's session from the session cookie or a bearer token and
/// stores it as `Option<Session>` in the request extensions.
pub async fn extract_user<B>(
    State(state): State<Arc<AppState>>,
    cookies: Cookies,
    mut req: Request<B>,
    next: Next<B>,
) -> Response
where
    B: Send + 'static,
{
    let token = cookies
        .get(&state.config.session_cookie)
        .map(|cookie| cookie.value().to_string())
        .or_else(|| bearer_token(&req));

    let session = match token {
        Some(token) => match state.session_repo.find_active(&token).await {
            Ok(session) => session,
            Err(err) => {
                // Fail closed: the request continues unauthenticated.
                error!(error = %err, "session lookup failed");
                None
            }
        },
        None => None,
    };

    req.extensions_mut().insert(session);
    next.run(req).await
}

pub async fn auth<B>(
    Extension(session): Extension<Option<Session>>,
    req: Request<B>,
    next: Next<B>,
) -> Response
where
    B: Send + 'static,
{
    match session {
        Some(_) => next.run(req).await,
        None => error_response(StatusCode::UNAUTHORIZED, "unauthorized", "You need to log in"),
    }
}
