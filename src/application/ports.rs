use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Raw page markup plus the local stylesheet files it links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPage {
    pub html: String,
    pub stylesheets: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch [{url}]: {detail}")]
    Failure { url: String, detail: String },
    #[error("[{url}] returned 404 not found")]
    NotFound { url: String },
}

#[async_trait]
pub trait HtmlFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// One extraction run for one viewport.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub html: &'a str,
    pub stylesheets: &'a [PathBuf],
    pub width: u32,
    pub height: u32,
    pub ignore: &'a [String],
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to launch extractor `{bin}`: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("extractor exited with status {exit_code:?}: {stderr}")]
    Exit {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("extractor did not finish within {} ms", .timeout.as_millis())]
    Timeout { timeout: Duration },
    #[error("extractor produced no CSS")]
    Empty,
    #[error("extractor i/o error: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait CssExtractor: Send + Sync {
    /// Critical-path CSS for the page at the requested viewport size.
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<String, ExtractionError>;
}
