//! TOML-backed site directory.
//!
//! The content system exports its URL structure to a file:
//!
//! ```toml
//! home = "/"
//! archives = ["/blog/", "/2024/"]
//!
//! [[posts]]
//! id = 1
//! url = "/hello-world/"
//! status = "published"
//!
//! [[terms]]
//! id = 3
//! taxonomy = "category"
//! url = "/category/news/"
//!
//! [[comments]]
//! id = 9
//! post_id = 1
//! ```
//!
//! Relative URLs are resolved against the site base URL. When backed by a
//! file, the file is re-read on every lookup so exports are picked up without
//! a restart.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::application::site::{DirectoryError, SiteDirectory};
use crate::cache::normalize_url;
use crate::domain::entities::{CommentEntry, PostEntry, TermEntry};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiteMap {
    pub home: Option<String>,
    pub archives: Vec<String>,
    pub posts: Vec<PostEntry>,
    pub terms: Vec<TermEntry>,
    pub comments: Vec<CommentEntry>,
}

impl SiteMap {
    pub fn from_toml_str(source: &str) -> Result<Self, DirectoryError> {
        toml::from_str(source).map_err(|err| DirectoryError::Malformed(err.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self, DirectoryError> {
        let source = tokio::fs::read_to_string(path).await.map_err(|err| {
            DirectoryError::unavailable(format!("failed to read `{}`: {err}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }
}

#[derive(Debug, Clone)]
enum Source {
    Static(SiteMap),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SiteMapDirectory {
    source: Source,
    base: Url,
}

impl SiteMapDirectory {
    pub fn new(map: SiteMap, base: Url) -> Self {
        Self {
            source: Source::Static(map),
            base,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>, base: Url) -> Self {
        Self {
            source: Source::File(path.into()),
            base,
        }
    }

    async fn snapshot(&self) -> Result<SiteMap, DirectoryError> {
        match &self.source {
            Source::Static(map) => Ok(map.clone()),
            Source::File(path) => SiteMap::load(path).await,
        }
    }

    fn absolute(&self, url: &str) -> String {
        match self.base.join(url.trim()) {
            Ok(joined) => normalize_url(joined.as_str()),
            Err(_) => normalize_url(url),
        }
    }
}

#[async_trait]
impl SiteDirectory for SiteMapDirectory {
    async fn find_post(&self, id: u64) -> Result<Option<PostEntry>, DirectoryError> {
        let map = self.snapshot().await?;
        Ok(map.posts.into_iter().find(|post| post.id == id).map(|post| PostEntry {
            url: self.absolute(&post.url),
            ..post
        }))
    }

    async fn comment_post(&self, comment_id: u64) -> Result<Option<u64>, DirectoryError> {
        let map = self.snapshot().await?;
        Ok(map
            .comments
            .iter()
            .find(|comment| comment.id == comment_id)
            .map(|comment| comment.post_id))
    }

    async fn term_url(&self, id: u64, taxonomy: &str) -> Result<Option<String>, DirectoryError> {
        let map = self.snapshot().await?;
        Ok(map
            .terms
            .iter()
            .find(|term| term.id == id && term.taxonomy == taxonomy)
            .map(|term| self.absolute(&term.url)))
    }

    async fn taxonomy_urls(&self, taxonomy: &str) -> Result<Vec<String>, DirectoryError> {
        let map = self.snapshot().await?;
        Ok(map
            .terms
            .iter()
            .filter(|term| term.taxonomy == taxonomy)
            .map(|term| self.absolute(&term.url))
            .collect())
    }

    async fn all_urls(&self) -> Result<Vec<String>, DirectoryError> {
        let map = self.snapshot().await?;
        let home = map.home.as_deref().unwrap_or("/");

        let candidates = std::iter::once(home)
            .chain(
                map.posts
                    .iter()
                    .filter(|post| post.status.is_public())
                    .map(|post| post.url.as_str()),
            )
            .chain(map.archives.iter().map(String::as_str))
            .chain(map.terms.iter().map(|term| term.url.as_str()));

        let mut seen = HashSet::new();
        Ok(candidates
            .map(|url| self.absolute(url))
            .filter(|url| seen.insert(url.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::domain::types::PostStatus;

    const MAP: &str = r#"
home = "/"
archives = ["/blog/", "/blog"]

[[posts]]
id = 1
url = "/hello/"
status = "published"

[[posts]]
id = 2
url = "/draft/"
status = "draft"

[[terms]]
id = 3
taxonomy = "category"
url = "/category/news/"

[[terms]]
id = 4
taxonomy = "post_tag"
url = "https://example.test/tag/rust"

[[comments]]
id = 9
post_id = 1
"#;

    fn directory() -> SiteMapDirectory {
        let map = SiteMap::from_toml_str(MAP).expect("valid map");
        SiteMapDirectory::new(map, Url::parse("https://example.test/").expect("base"))
    }

    #[tokio::test]
    async fn resolves_posts_against_base() {
        let post = directory()
            .find_post(1)
            .await
            .expect("lookup")
            .expect("post exists");
        assert_eq!(post.url, "https://example.test/hello/");
        assert_eq!(post.status, PostStatus::Published);
        assert!(directory().find_post(99).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn resolves_terms_and_comments() {
        let directory = directory();
        assert_eq!(
            directory.term_url(3, "category").await.expect("lookup"),
            Some("https://example.test/category/news/".to_string())
        );
        assert_eq!(directory.term_url(3, "post_tag").await.expect("lookup"), None);
        assert_eq!(
            directory.taxonomy_urls("post_tag").await.expect("lookup"),
            vec!["https://example.test/tag/rust/".to_string()]
        );
        assert_eq!(directory.comment_post(9).await.expect("lookup"), Some(1));
    }

    #[tokio::test]
    async fn all_urls_skips_unpublished_and_duplicates() {
        let urls = directory().all_urls().await.expect("urls");
        assert_eq!(
            urls,
            vec![
                "https://example.test/".to_string(),
                "https://example.test/hello/".to_string(),
                "https://example.test/blog/".to_string(),
                "https://example.test/category/news/".to_string(),
                "https://example.test/tag/rust/".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn file_source_is_reread() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("site.toml");
        std::fs::write(&path, "home = \"/\"\n").expect("write map");
        let directory =
            SiteMapDirectory::from_file(&path, Url::parse("https://example.test/").expect("base"));

        assert_eq!(directory.all_urls().await.expect("urls").len(), 1);

        std::fs::write(&path, MAP).expect("rewrite map");
        assert_eq!(directory.all_urls().await.expect("urls").len(), 5);
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let directory = SiteMapDirectory::from_file(
            "/nonexistent/abovefold/site.toml",
            Url::parse("https://example.test/").expect("base"),
        );
        let err = directory.all_urls().await.expect_err("missing file");
        assert!(matches!(err, DirectoryError::Unavailable(_)));
    }

    #[test]
    fn malformed_map_is_reported() {
        let err = SiteMap::from_toml_str("[[posts]]\nid = \"x\"").expect_err("bad map");
        assert!(matches!(err, DirectoryError::Malformed(_)));
    }
}
