use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::{application::error::HttpError, cache::{ChangeEvent, site_url}};

use super::AdminState;

#[derive(Debug, Serialize)]
pub(super) struct PlanResponse {
    event: &'static str,
    urls: Vec<String>,
}

impl PlanResponse {
    pub(super) fn new(event: &'static str, urls: Vec<String>) -> Self {
        Self { event, urls }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RegenerateRequest {
    url: String,
}

#[derive(Debug, Serialize)]
pub(super) struct QueueResponse {
    queued: bool,
    pending: usize,
}

#[derive(Debug, Serialize)]
pub(super) struct QueueStatus {
    pending: usize,
}

/// Content-change webhook. Answers once regeneration is queued.
pub(super) async fn receive_event(
    State(state): State<AdminState>,
    Json(event): Json<ChangeEvent>,
) -> Result<Response, HttpError> {
    let kind = event.kind();
    let plan = state.trigger.on_change(event).await?;
    let body = PlanResponse::new(kind, plan.into_urls());
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

/// Queue one URL without touching the rest of the store.
pub(super) async fn regenerate_url(
    State(state): State<AdminState>,
    Json(request): Json<RegenerateRequest>,
) -> Result<Response, HttpError> {
    if request.url.trim().is_empty() {
        return Err(HttpError::new(
            "infra::http::admin::regenerate_url",
            StatusCode::BAD_REQUEST,
            "Missing url",
            "regenerate request carried an empty url",
        ));
    }
    let Some(url) = site_url(&state.site_base, &request.url) else {
        return Err(HttpError::new(
            "infra::http::admin::regenerate_url",
            StatusCode::BAD_REQUEST,
            "URL is not on this site",
            format!("{} is outside {}", request.url.trim(), state.site_base),
        ));
    };
    if state.store.is_pretend() {
        return Ok(queue_response(&state, false));
    }
    if let Err(err) = state.store.clear_url(&url) {
        return Err(HttpError::from_error(
            "infra::http::admin::regenerate_url",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to clear stale artifacts",
            &err,
        ));
    }
    let queued = state.trigger.queue().submit(&url);
    Ok(queue_response(&state, queued))
}

pub(super) async fn queue_status(State(state): State<AdminState>) -> Response {
    Json(QueueStatus {
        pending: state.trigger.queue().pending(),
    })
    .into_response()
}

fn queue_response(state: &AdminState, queued: bool) -> Response {
    let body = QueueResponse {
        queued,
        pending: state.trigger.queue().pending(),
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}
