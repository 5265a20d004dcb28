//! HTML fetcher backed by the live site.
//!
//! Fetches the page with the render header set (so the site serves it
//! without inlined CSS), strips any leftover inlined block and maps the
//! linked stylesheets onto local files for the extractor.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::application::ports::{FetchError, FetchedPage, HtmlFetcher};
use crate::cache::RENDER_FETCH_HEADER;
use crate::infra::error::InfraError;

/// Public URL prefix under which the site serves files from `root_dir`.
#[derive(Debug, Clone)]
pub struct AssetMapping {
    pub public_url: Url,
    pub root_dir: PathBuf,
}

impl AssetMapping {
    pub fn new(mut public_url: Url, root_dir: PathBuf) -> Self {
        if !public_url.path().ends_with('/') {
            let path = format!("{}/", public_url.path());
            public_url.set_path(&path);
        }
        Self {
            public_url,
            root_dir,
        }
    }

    /// Local file for a stylesheet URL, if it lives under the public prefix.
    pub fn local_path(&self, url: &Url) -> Option<PathBuf> {
        if url.origin() != self.public_url.origin() {
            return None;
        }
        let relative = url.path().strip_prefix(self.public_url.path())?;
        let mut path = self.root_dir.clone();
        for segment in relative.split('/') {
            match segment {
                "" | "." => {}
                ".." => return None,
                segment => path.push(segment),
            }
        }
        (path != self.root_dir).then_some(path)
    }
}

#[derive(Debug, Clone)]
pub struct HttpHtmlFetcher {
    client: Client,
    assets: AssetMapping,
}

impl HttpHtmlFetcher {
    pub fn new(assets: AssetMapping, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self { client, assets })
    }

    pub fn user_agent() -> &'static str {
        concat!("abovefold/", env!("CARGO_PKG_VERSION"))
    }

    async fn resolve_stylesheets(&self, page: &Url, hrefs: Vec<String>) -> Vec<PathBuf> {
        let mut resolved: Vec<PathBuf> = Vec::with_capacity(hrefs.len());
        for href in hrefs {
            let Ok(url) = page.join(&href) else {
                debug!(target = "infra::fetch", href = %href, "unparseable stylesheet href");
                continue;
            };
            let Some(path) = self.assets.local_path(&url) else {
                debug!(target = "infra::fetch", href = %url, "stylesheet outside asset root");
                continue;
            };
            if !is_file(&path).await {
                debug!(
                    target = "infra::fetch",
                    path = %path.display(),
                    "stylesheet file missing"
                );
                continue;
            }
            if !resolved.contains(&path) {
                resolved.push(path);
            }
        }
        resolved
    }
}

#[async_trait]
impl HtmlFetcher for HttpHtmlFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let failure = |detail: String| FetchError::Failure {
            url: url.to_string(),
            detail,
        };

        let page_url = Url::parse(url).map_err(|err| failure(err.to_string()))?;
        let response = self
            .client
            .get(page_url.clone())
            .header(RENDER_FETCH_HEADER, "1")
            .send()
            .await
            .map_err(|err| failure(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(failure(format!("unexpected status {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|err| failure(err.to_string()))?;
        let (html, hrefs) = scan_document(&body).map_err(|err| failure(err.to_string()))?;
        let stylesheets = self.resolve_stylesheets(&page_url, hrefs).await;

        debug!(
            target = "infra::fetch",
            url = %url,
            html_bytes = html.len(),
            stylesheets = stylesheets.len(),
            "page fetched"
        );
        Ok(FetchedPage { html, stylesheets })
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

/// Drop inlined critical CSS and collect stylesheet hrefs in document order.
fn scan_document(html: &str) -> Result<(String, Vec<String>), lol_html::errors::RewritingError> {
    let hrefs = Rc::new(RefCell::new(Vec::new()));

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("style[data-inlined]", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("link[rel][href]", {
                    let hrefs = Rc::clone(&hrefs);
                    move |el| {
                        let rel = el.get_attribute("rel").unwrap_or_default();
                        let is_stylesheet = rel
                            .split_ascii_whitespace()
                            .any(|token| token.eq_ignore_ascii_case("stylesheet"));
                        if is_stylesheet && let Some(href) = el.get_attribute("href") {
                            let href = href.trim().to_string();
                            let mut hrefs = hrefs.borrow_mut();
                            if !href.is_empty() && !hrefs.contains(&href) {
                                hrefs.push(href);
                            }
                        }
                        Ok(())
                    }
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )?;

    let hrefs = hrefs.take();
    Ok((rewritten, hrefs))
}
