use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::PostEntry;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("site directory unavailable: {0}")]
    Unavailable(String),
    #[error("site directory is malformed: {0}")]
    Malformed(String),
}

impl DirectoryError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Read access to the site's content and URL structure.
#[async_trait]
pub trait SiteDirectory: Send + Sync {
    async fn find_post(&self, id: u64) -> Result<Option<PostEntry>, DirectoryError>;

    /// Post a comment belongs to.
    async fn comment_post(&self, comment_id: u64) -> Result<Option<u64>, DirectoryError>;

    async fn term_url(&self, id: u64, taxonomy: &str) -> Result<Option<String>, DirectoryError>;

    /// URLs of every term in `taxonomy`.
    async fn taxonomy_urls(&self, taxonomy: &str) -> Result<Vec<String>, DirectoryError>;

    /// Home, every published post, every archive and every term.
    async fn all_urls(&self) -> Result<Vec<String>, DirectoryError>;
}
