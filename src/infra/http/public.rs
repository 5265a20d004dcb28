//! Public surface: a reverse proxy in front of the site, with critical CSS
//! inlined into HTML responses on the way out.

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderName, Method, Request, StatusCode,
        request::Parts,
        header::{
            ACCEPT, ACCEPT_LANGUAGE, CONNECTION, COOKIE, IF_MODIFIED_SINCE, IF_NONE_MATCH,
            TRANSFER_ENCODING, USER_AGENT,
        },
    },
    middleware,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{
    application::error::HttpError,
    cache::{CriticalCssState, RENDER_FETCH_HEADER, critical_css_layer},
};

use super::middleware::{log_responses, set_request_context};

const FORWARDED_REQUEST_HEADERS: &[HeaderName] = &[
    ACCEPT,
    ACCEPT_LANGUAGE,
    COOKIE,
    IF_MODIFIED_SINCE,
    IF_NONE_MATCH,
    USER_AGENT,
];

#[derive(Clone)]
pub struct ProxyState {
    pub client: Client,
    pub upstream: Url,
}

pub fn build_router(proxy: ProxyState, critical_css: CriticalCssState) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(proxy)
        .layer(middleware::from_fn_with_state(
            critical_css,
            critical_css_layer,
        ))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn forward(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    let (parts, _body) = request.into_parts();
    match proxy_request(&state, &parts).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn proxy_request(state: &ProxyState, request: &Parts) -> Result<Response, HttpError> {
    let method = &request.method;
    if method != Method::GET && method != Method::HEAD {
        return Err(HttpError::new(
            "infra::http::public::forward",
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
            format!("{method} is not proxied"),
        ));
    }

    let path_and_query = request
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let target = state.upstream.join(path_and_query).map_err(|err| {
        HttpError::from_error(
            "infra::http::public::forward",
            StatusCode::BAD_REQUEST,
            "Invalid request path",
            &err,
        )
    })?;

    let render_header = HeaderName::from_static(RENDER_FETCH_HEADER);
    let mut upstream_request = state.client.request(method.clone(), target.clone());
    for name in FORWARDED_REQUEST_HEADERS.iter().chain([&render_header]) {
        for value in request.headers.get_all(name) {
            upstream_request = upstream_request.header(name, value);
        }
    }

    let upstream = upstream_request.send().await.map_err(|err| {
        HttpError::from_error(
            "infra::http::public::forward",
            StatusCode::BAD_GATEWAY,
            "Upstream unavailable",
            &err,
        )
    })?;

    let status = upstream.status();
    let headers = response_headers(upstream.headers());
    let body: Bytes = upstream.bytes().await.map_err(|err| {
        HttpError::from_error(
            "infra::http::public::forward",
            StatusCode::BAD_GATEWAY,
            "Upstream response truncated",
            &err,
        )
    })?;

    debug!(
        target = "abovefold::http::proxy",
        upstream = %target,
        status = status.as_u16(),
        bytes = body.len(),
        "proxied request"
    );

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in [CONNECTION, TRANSFER_ENCODING] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}
