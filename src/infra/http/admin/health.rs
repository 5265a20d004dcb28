use axum::{extract::State, response::Response};

use super::super::store_health_response;
use super::AdminState;

pub(super) async fn admin_health(State(state): State<AdminState>) -> Response {
    store_health_response(state.store.ensure_root_exists())
}
