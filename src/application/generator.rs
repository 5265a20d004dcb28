//! Critical CSS generation.
//!
//! Fetches a page once, runs the extractor for each configured viewport and
//! stores the results. Viewports are independent: one failing does not stop
//! the others.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use thiserror::Error;
use tracing::{info, warn};

use crate::application::ports::{
    CssExtractor, ExtractionError, ExtractionRequest, FetchError, FetchedPage, HtmlFetcher,
};
use crate::cache::{ArtifactStore, CacheKey, StoreError, ViewportClass, ViewportSpec, ViewportTable};

const METRIC_GENERATE_MS: &str = "abovefold_generate_ms";

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("viewport `{0}` is not configured")]
    UnknownViewport(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("extraction failed for [{key}]: {source}")]
    Extraction {
        key: String,
        #[source]
        source: ExtractionError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GenerateError {
    pub fn label(&self) -> &'static str {
        match self {
            GenerateError::UnknownViewport(_) => "unknown_viewport",
            GenerateError::Fetch(FetchError::NotFound { .. }) => "not_found",
            GenerateError::Fetch(FetchError::Failure { .. }) => "fetch_failure",
            GenerateError::Extraction { .. } => "extraction_failure",
            GenerateError::Store(_) => "write_error",
        }
    }

    /// Page-level problems that are reported as warnings rather than errors.
    pub fn is_page_problem(&self) -> bool {
        matches!(self, GenerateError::Fetch(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generated {
    Written(PathBuf),
    /// Pretend mode: nothing was fetched, extracted or stored.
    Skipped,
}

#[derive(Debug)]
pub struct ViewportOutcome {
    pub viewport: ViewportClass,
    pub result: Result<Generated, GenerateError>,
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Selectors or patterns the extractor must leave out.
    pub ignore: Vec<String>,
    pub timeout: Duration,
}

pub struct CriticalCssGenerator {
    store: Arc<ArtifactStore>,
    viewports: ViewportTable,
    fetcher: Arc<dyn HtmlFetcher>,
    extractor: Arc<dyn CssExtractor>,
    options: GeneratorOptions,
}

impl CriticalCssGenerator {
    pub fn new(
        store: Arc<ArtifactStore>,
        viewports: ViewportTable,
        fetcher: Arc<dyn HtmlFetcher>,
        extractor: Arc<dyn CssExtractor>,
        options: GeneratorOptions,
    ) -> Self {
        Self {
            store,
            viewports,
            fetcher,
            extractor,
            options,
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn viewports(&self) -> &ViewportTable {
        &self.viewports
    }

    /// Generate and store the artifact for one `(url, viewport)` pair.
    pub async fn generate(
        &self,
        url: &str,
        viewport: &ViewportClass,
    ) -> Result<Generated, GenerateError> {
        if self.store.is_pretend() {
            return Ok(Generated::Skipped);
        }

        let spec = self
            .viewports
            .get(viewport)
            .ok_or_else(|| GenerateError::UnknownViewport(viewport.to_string()))?;
        let page = self.fetcher.fetch(url).await?;
        self.extract_and_store(url, spec, &page).await
    }

    /// Generate every configured viewport for `url` from a single fetch.
    ///
    /// A fetch failure fails the whole URL. Extraction and write failures are
    /// reported per viewport.
    pub async fn generate_all(&self, url: &str) -> Result<Vec<ViewportOutcome>, GenerateError> {
        if self.store.is_pretend() {
            return Ok(self
                .viewports
                .iter()
                .map(|spec| ViewportOutcome {
                    viewport: spec.name.clone(),
                    result: Ok(Generated::Skipped),
                })
                .collect());
        }

        let page = self.fetcher.fetch(url).await.inspect_err(|err| {
            warn!(
                target = "abovefold::generate",
                url = url,
                error = %err,
                "failed to fetch page for critical CSS"
            );
        })?;

        let mut outcomes = Vec::new();
        for spec in self.viewports.iter() {
            let result = self.extract_and_store(url, spec, &page).await;
            outcomes.push(ViewportOutcome {
                viewport: spec.name.clone(),
                result,
            });
        }
        Ok(outcomes)
    }

    async fn extract_and_store(
        &self,
        url: &str,
        spec: &ViewportSpec,
        page: &FetchedPage,
    ) -> Result<Generated, GenerateError> {
        let key = CacheKey::new(spec.name.clone(), url);
        let started_at = Instant::now();

        let request = ExtractionRequest {
            html: &page.html,
            stylesheets: &page.stylesheets,
            width: spec.width.get(),
            height: spec.height.get(),
            ignore: &self.options.ignore,
            timeout: self.options.timeout,
        };

        let css = self.extractor.extract(request).await.map_err(|source| {
            warn!(
                target = "abovefold::generate",
                key = %key,
                error = %source,
                "critical CSS extraction failed"
            );
            GenerateError::Extraction {
                key: key.to_string(),
                source,
            }
        })?;

        let path = self.store.write(&key, &css)?;

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_GENERATE_MS, "viewport" => spec.name.to_string()).record(elapsed_ms);
        info!(
            target = "abovefold::generate",
            key = %key,
            path = %path.display(),
            bytes = css.len(),
            elapsed_ms = elapsed_ms,
            "critical CSS generated"
        );

        Ok(Generated::Written(path))
    }
}
