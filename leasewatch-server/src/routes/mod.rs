pub mod admin;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .nest("/admin", admin::create_admin_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
