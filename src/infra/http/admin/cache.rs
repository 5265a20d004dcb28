use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::application::error::HttpError;

use super::AdminState;
use super::events::PlanResponse;

/// Drop every stored artifact and queue the whole site again.
pub(super) async fn flush_cache(State(state): State<AdminState>) -> Result<Response, HttpError> {
    let plan = state.trigger.global_invalidation().await?;
    let body = PlanResponse::new("global_invalidation", plan.into_urls());
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}
