//! Critical CSS middleware.
//!
//! Wraps HTML responses: asks the gate whether to inline, picks the
//! artifact for the client's viewport and rewrites the document head. Any
//! failure along the way serves the original response.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderValue, Method, Request, StatusCode, Uri,
        header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use lol_html::{
    RewriteStrSettings, element, errors::RewritingError, html_content::ContentType, rewrite_str,
};
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    classifier::{ClientSignals, ViewportClassifier},
    gate::{CacheGateKeeper, GateDecision},
    keys::{CacheKey, normalize_url},
    store::{ArtifactStore, style_block},
};

const MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;
const METRIC_GATE_DECISION: &str = "abovefold_gate_decision_total";
const PRELOAD_ONLOAD: &str = "this.onload=null;this.rel='stylesheet'";

/// Promotes preloaded stylesheets in browsers without `rel=preload` support.
pub const STYLESHEET_LOADER: &str = "<script data-abovefold-loader>(function(d){var l=d.createElement('link');try{if(l.relList.supports('preload'))return}catch(e){}var p=d.querySelectorAll('link[rel=\"preload\"][as=\"style\"]');for(var i=0;i<p.length;i++){p[i].rel='stylesheet'}})(document);</script>";

/// Shared state for the critical CSS middleware.
#[derive(Clone)]
pub struct CriticalCssState {
    pub store: Arc<ArtifactStore>,
    pub gate: Arc<CacheGateKeeper>,
    pub classifier: ViewportClassifier,
    /// Public origin used to rebuild the absolute page URL from the request.
    pub site_base: Url,
}

/// What to inject into one document.
#[derive(Debug, Clone, Copy)]
pub struct InlinePlan<'a> {
    /// Complete `<style data-inlined>` element.
    pub style_block: &'a str,
    /// Defer stylesheet links. Only safe when real critical CSS is inlined.
    pub defer_stylesheets: bool,
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn critical_css_layer(
    State(state): State<CriticalCssState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET || state.store.is_pretend() {
        return next.run(request).await;
    }

    let inputs = state.gate.inputs_for(request.headers());
    let decision = state.gate.decide(inputs);
    let label = decision.label();
    counter!(METRIC_GATE_DECISION, "decision" => label).increment(1);

    let GateDecision::Inline { marker } = decision else {
        debug!(decision = label, "serving response untouched");
        return next.run(request).await;
    };

    let viewport = state
        .classifier
        .classify(&ClientSignals::from_headers(request.headers()));
    let key = CacheKey::new(viewport, &page_url(&state.site_base, request.uri()));

    let response = next.run(request).await;
    if !is_rewritable(&response) {
        return response;
    }

    if !fits_buffer(&response) {
        debug!(key = %key, "HTML response too large or unsized; serving untouched");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_DOCUMENT_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(key = %key, error = %err, "failed to buffer HTML response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let html = match String::from_utf8(bytes.to_vec()) {
        Ok(html) => html,
        Err(err) => {
            debug!(key = %key, "response body is not UTF-8; serving untouched");
            return Response::from_parts(parts, Body::from(err.into_bytes()));
        }
    };

    let artifact = state.store.load(&key).await;
    let block = style_block(artifact.text());
    let plan = InlinePlan {
        style_block: &block,
        defer_stylesheets: artifact.is_stored(),
    };

    match rewrite_document(&html, &plan) {
        Ok(rewritten) => {
            parts.headers.remove(CONTENT_LENGTH);
            if artifact.is_stored() {
                let cookie = marker.set_cookie_value(OffsetDateTime::now_utc());
                match HeaderValue::from_str(&cookie) {
                    Ok(value) => {
                        parts.headers.append(SET_COOKIE, value);
                    }
                    Err(err) => warn!(error = %err, "invalid version marker cookie"),
                }
            }
            debug!(key = %key, stored = artifact.is_stored(), "critical CSS inlined");
            Response::from_parts(parts, Body::from(rewritten))
        }
        Err(err) => {
            warn!(key = %key, error = %err, "failed to rewrite document; serving untouched");
            Response::from_parts(parts, Body::from(html))
        }
    }
}

/// Inject the style block into `<head>` and, when requested, turn blocking
/// stylesheet links into preloads with a `<noscript>` fallback.
pub fn rewrite_document(html: &str, plan: &InlinePlan<'_>) -> Result<String, RewritingError> {
    let head_seen = Rc::new(Cell::new(false));
    let style_block = plan.style_block;
    let defer = plan.defer_stylesheets;

    let mut handlers = vec![element!("head", {
        let head_seen = Rc::clone(&head_seen);
        move |el| {
            if head_seen.replace(true) {
                return Ok(());
            }
            el.prepend(style_block, ContentType::Html);
            if defer {
                el.append(STYLESHEET_LOADER, ContentType::Html);
            }
            Ok(())
        }
    })];

    if defer {
        handlers.push(element!("link[rel][href]", |el| {
            let rel = el.get_attribute("rel").unwrap_or_default();
            if !is_blocking_stylesheet(&rel) {
                return Ok(());
            }

            let original = render_link_tag(
                el.attributes()
                    .iter()
                    .map(|attr| (attr.name(), attr.value())),
            );
            el.set_attribute("rel", "preload")?;
            el.set_attribute("as", "style")?;
            el.set_attribute("onload", PRELOAD_ONLOAD)?;
            el.after(&format!("<noscript>{original}</noscript>"), ContentType::Html);
            Ok(())
        }));
    }

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
}

fn is_blocking_stylesheet(rel: &str) -> bool {
    let mut stylesheet = false;
    for token in rel.split_ascii_whitespace() {
        if token.eq_ignore_ascii_case("alternate") {
            return false;
        }
        if token.eq_ignore_ascii_case("stylesheet") {
            stylesheet = true;
        }
    }
    stylesheet
}

fn render_link_tag(attributes: impl Iterator<Item = (String, String)>) -> String {
    let mut tag = String::from("<link");
    for (name, value) in attributes {
        tag.push(' ');
        tag.push_str(&name);
        tag.push_str("=\"");
        tag.push_str(&value.replace('"', "&quot;"));
        tag.push('"');
    }
    tag.push('>');
    tag
}

fn is_rewritable(response: &Response) -> bool {
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("text/html")
        });

    response.status() == StatusCode::OK
        && is_html
        && !response.headers().contains_key(CONTENT_ENCODING)
}

/// True when the body is known to fit the rewrite buffer. Needs a
/// `Content-Length` or a bounded size hint, and every known length must fit.
fn fits_buffer(response: &Response) -> bool {
    let declared = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let hinted = response.body().size_hint().upper();
    if declared.is_none() && hinted.is_none() {
        return false;
    }
    declared
        .into_iter()
        .chain(hinted)
        .all(|length| length <= MAX_DOCUMENT_BYTES as u64)
}

/// Absolute, normalized URL of the requested page.
fn page_url(base: &Url, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    match base.join(path_and_query) {
        Ok(url) => normalize_url(url.as_str()),
        Err(_) => normalize_url(path_and_query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>t</title><link rel="stylesheet" href="/style.css?ver=2" media="all"><link rel="icon" href="/favicon.ico"></head><body><p>hi</p></body></html>"#;

    #[test]
    fn inline_with_artifact_defers_stylesheets() {
        let block = style_block("body{margin:0}");
        let html = rewrite_document(
            PAGE,
            &InlinePlan {
                style_block: &block,
                defer_stylesheets: true,
            },
        )
        .expect("rewrite");

        assert!(html.contains("<head><style data-inlined>body{margin:0}</style><title>"));
        assert!(html.contains(
            r#"<link rel="preload" href="/style.css?ver=2" media="all" as="style" onload="this.onload=null;this.rel='stylesheet'">"#
        ));
        assert!(html.contains(
            r#"<noscript><link rel="stylesheet" href="/style.css?ver=2" media="all"></noscript>"#
        ));
        assert!(html.contains(r#"<link rel="icon" href="/favicon.ico">"#));
        assert!(html.contains("data-abovefold-loader"));
    }

    #[test]
    fn placeholder_leaves_stylesheets_alone() {
        let block = style_block("/* missing */");
        let html = rewrite_document(
            PAGE,
            &InlinePlan {
                style_block: &block,
                defer_stylesheets: false,
            },
        )
        .expect("rewrite");

        assert!(html.contains("<style data-inlined>/* missing */</style>"));
        assert!(html.contains(r#"<link rel="stylesheet" href="/style.css?ver=2" media="all">"#));
        assert!(!html.contains("preload"));
        assert!(!html.contains("data-abovefold-loader"));
    }

    #[test]
    fn alternate_stylesheets_are_not_deferred() {
        assert!(is_blocking_stylesheet("stylesheet"));
        assert!(is_blocking_stylesheet("StyleSheet"));
        assert!(!is_blocking_stylesheet("alternate stylesheet"));
        assert!(!is_blocking_stylesheet("preload"));
    }

    #[test]
    fn link_tag_rendering_escapes_quotes() {
        let tag = render_link_tag(
            [
                ("rel".to_string(), "stylesheet".to_string()),
                ("title".to_string(), "say \"hi\"".to_string()),
            ]
            .into_iter(),
        );
        assert_eq!(tag, r#"<link rel="stylesheet" title="say &quot;hi&quot;">"#);
    }

    #[test]
    fn page_url_joins_base_and_request() {
        let base = Url::parse("https://example.test/").expect("base");
        let uri: Uri = "/blog/post?page=2".parse().expect("uri");
        assert_eq!(page_url(&base, &uri), "https://example.test/blog/post/?page=2");
    }

    #[test]
    fn buffering_needs_a_known_length_that_fits() {
        let small = Response::new(Body::from("<html></html>"));
        assert!(fits_buffer(&small));

        let large = Response::new(Body::from(vec![b'a'; MAX_DOCUMENT_BYTES + 1]));
        assert!(!fits_buffer(&large));

        let chunks = futures::stream::iter([Ok::<_, std::io::Error>("<html>")]);
        let streamed = Response::new(Body::from_stream(chunks));
        assert!(!fits_buffer(&streamed));

        let mut understated = Response::new(Body::from(vec![b'a'; MAX_DOCUMENT_BYTES + 1]));
        understated
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert!(!fits_buffer(&understated));
    }
}
