mod cache;
mod events;
mod health;
mod state;

pub use state::AdminState;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use super::middleware::{log_responses, set_request_context};

/// Operator surface: change webhooks, cache flush and health.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health::admin_health))
        .route("/events", post(events::receive_event))
        .route("/regenerate", post(events::regenerate_url))
        .route("/queue", get(events::queue_status))
        .route("/flush", post(cache::flush_cache))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}
