use std::sync::Arc;

use axum::Router;
use tower_cookies::CookieManagerLayer;
use tower_http::trace::TraceLayer;

use crate::{middleware::extract_user, AppState};

mod app;
pub use app::app_router;

/// The full service: routes plus session resolution and request tracing.
pub fn build_app(state: Arc<AppState>) -> Router {
    app_router(state.clone())
        .layer(axum::middleware::from_fn_with_state(state, extract_user))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
}
