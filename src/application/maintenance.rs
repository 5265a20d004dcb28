//! Operator commands: bulk or single-URL generation and store clearing.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::application::generator::{
    CriticalCssGenerator, GenerateError, Generated, ViewportOutcome,
};
use crate::application::site::{DirectoryError, SiteDirectory};
use crate::cache::{
    ConfigValidationError, StoreError, ViewportClass, ViewportClassifier, normalize_url,
    site_url,
};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("[{uri}] is not a valid URI for this website ({home})")]
    ForeignUri { uri: String, home: String },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailure {
    pub url: String,
    /// `None` when the whole URL failed before any viewport ran.
    pub viewport: Option<ViewportClass>,
    pub reason: &'static str,
    pub message: String,
    /// Page-level problem (missing or unreachable page) rather than a fault.
    pub warning: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateReport {
    pub urls: usize,
    pub written: usize,
    pub skipped: usize,
    pub failures: Vec<GenerationFailure>,
}

impl GenerateReport {
    fn record(&mut self, url: &str, result: Result<Vec<ViewportOutcome>, GenerateError>) {
        self.urls += 1;
        match result {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match outcome.result {
                        Ok(Generated::Written(_)) => self.written += 1,
                        Ok(Generated::Skipped) => self.skipped += 1,
                        Err(err) => self.failures.push(GenerationFailure {
                            url: url.to_string(),
                            viewport: Some(outcome.viewport),
                            reason: err.label(),
                            message: err.to_string(),
                            warning: err.is_page_problem(),
                        }),
                    }
                }
            }
            Err(err) => self.failures.push(GenerationFailure {
                url: url.to_string(),
                viewport: None,
                reason: err.label(),
                message: err.to_string(),
                warning: err.is_page_problem(),
            }),
        }
    }
}

pub struct MaintenanceService {
    generator: Arc<CriticalCssGenerator>,
    directory: Arc<dyn SiteDirectory>,
    classifier: ViewportClassifier,
    site_base: Url,
    concurrency: usize,
}

impl MaintenanceService {
    pub fn new(
        generator: Arc<CriticalCssGenerator>,
        directory: Arc<dyn SiteDirectory>,
        site_base: Url,
        concurrency: usize,
    ) -> Self {
        Self {
            generator,
            directory,
            classifier: ViewportClassifier::new(),
            site_base,
            concurrency: concurrency.max(1),
        }
    }

    /// Regenerate one URL, or clear the store and regenerate the whole site.
    ///
    /// Per-URL failures are collected in the report; only configuration and
    /// storage problems abort the run.
    pub async fn generate(&self, uri: Option<&str>) -> Result<GenerateReport, MaintenanceError> {
        self.generator
            .viewports()
            .validate(&self.classifier.classes())?;
        let store = self.generator.store();

        let urls = match uri {
            Some(uri) => {
                let url = self.sanitize_uri(uri)?;
                store.ensure_root_exists()?;
                store.clear_url(&url)?;
                vec![url]
            }
            None => {
                store.clear(None)?;
                store.ensure_root_exists()?;
                self.directory.all_urls().await?
            }
        };

        info!(
            target = "abovefold::generate",
            urls = urls.len(),
            concurrency = self.concurrency,
            "generating critical CSS"
        );

        let results: Vec<_> = stream::iter(urls)
            .map(|url| async move {
                let result = self.generator.generate_all(&url).await;
                (url, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = GenerateReport::default();
        for (url, result) in results {
            report.record(&url, result);
        }

        info!(
            target = "abovefold::generate",
            urls = report.urls,
            written = report.written,
            failed = report.failures.len(),
            "critical CSS generation finished"
        );
        Ok(report)
    }

    /// Remove every stored artifact.
    pub fn clear(&self) -> Result<(), MaintenanceError> {
        self.generator.store().clear(None)?;
        info!(target = "abovefold::clear", "critical CSS store cleared");
        Ok(())
    }

    fn sanitize_uri(&self, uri: &str) -> Result<String, MaintenanceError> {
        site_url(&self.site_base, uri).ok_or_else(|| MaintenanceError::ForeignUri {
            uri: uri.to_string(),
            home: normalize_url(self.site_base.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::application::generator::GeneratorOptions;
    use crate::application::ports::{
        CssExtractor, ExtractionError, ExtractionRequest, FetchError, FetchedPage, HtmlFetcher,
    };
    use crate::cache::{ArtifactStore, ViewportTable};
    use crate::infra::sitemap::{SiteMap, SiteMapDirectory};

    struct NoFetch;

    #[async_trait]
    impl HtmlFetcher for NoFetch {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            Err(FetchError::Failure {
                url: url.to_string(),
                detail: "offline".to_string(),
            })
        }
    }

    struct NoExtract;

    #[async_trait]
    impl CssExtractor for NoExtract {
        async fn extract(&self, _: ExtractionRequest<'_>) -> Result<String, ExtractionError> {
            Err(ExtractionError::Empty)
        }
    }

    fn service(dir: &TempDir) -> MaintenanceService {
        let base = Url::parse("https://example.test/").expect("base");
        let store = Arc::new(ArtifactStore::new(
            dir.path().join("css"),
            ViewportTable::default().classes(),
            false,
        ));
        let generator = Arc::new(CriticalCssGenerator::new(
            store,
            ViewportTable::default(),
            Arc::new(NoFetch),
            Arc::new(NoExtract),
            GeneratorOptions {
                ignore: Vec::new(),
                timeout: Duration::from_secs(1),
            },
        ));
        let directory = Arc::new(SiteMapDirectory::new(SiteMap::default(), base.clone()));
        MaintenanceService::new(generator, directory, base, 2)
    }

    #[test]
    fn sanitize_accepts_site_urls() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        assert_eq!(
            service
                .sanitize_uri("https://example.test/about")
                .expect("own url"),
            "https://example.test/about/"
        );
        assert_eq!(
            service.sanitize_uri("/about").expect("relative path"),
            "https://example.test/about/"
        );
    }

    #[test]
    fn sanitize_rejects_foreign_hosts() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(&dir);
        for uri in [
            "https://other.test/about",
            "https://example.test.evil.test/",
            "//other.test/about",
        ] {
            let err = service.sanitize_uri(uri).expect_err("foreign");
            assert!(matches!(err, MaintenanceError::ForeignUri { .. }));
        }
    }

    #[tokio::test]
    async fn fetch_failures_are_reported_as_warnings() {
        let dir = TempDir::new().expect("tempdir");
        let report = service(&dir)
            .generate(Some("https://example.test/a"))
            .await
            .expect("run completes");

        assert_eq!(report.urls, 1);
        assert_eq!(report.written, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].warning);
        assert_eq!(report.failures[0].reason, "fetch_failure");
    }
}
