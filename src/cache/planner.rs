//! Regeneration planner.
//!
//! Maps a content change to the set of URLs whose critical CSS must be
//! regenerated.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::application::site::{DirectoryError, SiteDirectory};

use super::events::ChangeEvent;
use super::keys::normalize_url;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("term {id} in taxonomy `{taxonomy}` has no resolvable URL")]
    TermResolution { id: u64, taxonomy: String },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Ordered, de-duplicated URL set produced for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegenerationPlan {
    urls: Vec<String>,
}

impl RegenerationPlan {
    fn from_urls(urls: impl IntoIterator<Item = String>) -> Self {
        let mut seen = HashSet::new();
        let urls = urls
            .into_iter()
            .map(|url| normalize_url(&url))
            .filter(|url| seen.insert(url.clone()))
            .collect();
        Self { urls }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn into_urls(self) -> Vec<String> {
        self.urls
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

impl fmt::Display for RegenerationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegenerationPlan {{ urls: {} }}", self.urls.len())
    }
}

pub struct RegenerationPlanner {
    directory: Arc<dyn SiteDirectory>,
}

impl RegenerationPlanner {
    pub fn new(directory: Arc<dyn SiteDirectory>) -> Self {
        Self { directory }
    }

    pub async fn plan(&self, event: &ChangeEvent) -> Result<RegenerationPlan, PlanError> {
        let urls = match event {
            ChangeEvent::PostChanged { post_id } => self.post_urls(*post_id).await?,
            ChangeEvent::TermsChanged {
                ids,
                taxonomy,
                affects_all,
            } => {
                if *affects_all {
                    self.directory.taxonomy_urls(taxonomy).await?
                } else {
                    let mut urls = Vec::with_capacity(ids.len());
                    for id in ids {
                        let url = self.directory.term_url(*id, taxonomy).await?.ok_or_else(|| {
                            PlanError::TermResolution {
                                id: *id,
                                taxonomy: taxonomy.clone(),
                            }
                        })?;
                        urls.push(url);
                    }
                    urls
                }
            }
            ChangeEvent::CommentChanged { comment_id } => {
                match self.directory.comment_post(*comment_id).await? {
                    Some(post_id) => self.post_urls(post_id).await?,
                    None => {
                        debug!(comment_id = *comment_id, "comment has no known post");
                        Vec::new()
                    }
                }
            }
            ChangeEvent::GlobalInvalidation => self.directory.all_urls().await?,
        };

        Ok(RegenerationPlan::from_urls(urls))
    }

    async fn post_urls(&self, post_id: u64) -> Result<Vec<String>, PlanError> {
        let post = self.directory.find_post(post_id).await?;
        Ok(post
            .filter(|post| post.status.is_public())
            .map(|post| vec![post.url])
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::infra::sitemap::{SiteMap, SiteMapDirectory};

    const MAP: &str = r#"
archives = ["/blog/"]

[[posts]]
id = 42
url = "/hello/"
status = "published"

[[posts]]
id = 7
url = "/draft/"
status = "draft"

[[comments]]
id = 5
post_id = 42

[[comments]]
id = 6
post_id = 7

[[terms]]
id = 1
taxonomy = "category"
url = "/category/one/"

[[terms]]
id = 2
taxonomy = "category"
url = "/category/two/"

[[terms]]
id = 3
taxonomy = "category"
url = "/category/three/"

[[terms]]
id = 10
taxonomy = "post_tag"
url = "/tag/rust/"
"#;

    fn planner() -> RegenerationPlanner {
        let map = SiteMap::from_toml_str(MAP).expect("valid map");
        let base = Url::parse("https://example.test/").expect("base");
        RegenerationPlanner::new(Arc::new(SiteMapDirectory::new(map, base)))
    }

    #[tokio::test]
    async fn published_post_yields_its_url() {
        let plan = planner()
            .plan(&ChangeEvent::PostChanged { post_id: 42 })
            .await
            .expect("plan");
        assert_eq!(plan.urls(), ["https://example.test/hello/"]);
    }

    #[tokio::test]
    async fn draft_and_missing_posts_yield_nothing() {
        let planner = planner();
        for post_id in [7, 999] {
            let plan = planner
                .plan(&ChangeEvent::PostChanged { post_id })
                .await
                .expect("plan");
            assert!(plan.is_empty());
        }
    }

    #[tokio::test]
    async fn single_term_yields_one_url() {
        let plan = planner()
            .plan(&ChangeEvent::TermsChanged {
                ids: vec![3],
                taxonomy: "category".to_string(),
                affects_all: false,
            })
            .await
            .expect("plan");
        assert_eq!(plan.urls(), ["https://example.test/category/three/"]);
    }

    #[tokio::test]
    async fn clean_term_change_covers_whole_taxonomy() {
        let plan = planner()
            .plan(&ChangeEvent::TermsChanged {
                ids: vec![1],
                taxonomy: "category".to_string(),
                affects_all: true,
            })
            .await
            .expect("plan");
        assert_eq!(plan.urls().len(), 3);
    }

    #[tokio::test]
    async fn unresolvable_term_is_an_error() {
        let err = planner()
            .plan(&ChangeEvent::TermsChanged {
                ids: vec![1, 404],
                taxonomy: "category".to_string(),
                affects_all: false,
            })
            .await
            .expect_err("term 404 does not exist");
        assert!(matches!(err, PlanError::TermResolution { id: 404, .. }));
    }

    #[tokio::test]
    async fn comment_follows_its_post() {
        let planner = planner();
        let plan = planner
            .plan(&ChangeEvent::CommentChanged { comment_id: 5 })
            .await
            .expect("plan");
        assert_eq!(plan.urls(), ["https://example.test/hello/"]);

        let on_draft = planner
            .plan(&ChangeEvent::CommentChanged { comment_id: 6 })
            .await
            .expect("plan");
        assert!(on_draft.is_empty());

        let unknown = planner
            .plan(&ChangeEvent::CommentChanged { comment_id: 123 })
            .await
            .expect("plan");
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn global_invalidation_covers_site() {
        let plan = planner()
            .plan(&ChangeEvent::GlobalInvalidation)
            .await
            .expect("plan");
        assert_eq!(
            plan.urls(),
            [
                "https://example.test/",
                "https://example.test/hello/",
                "https://example.test/blog/",
                "https://example.test/category/one/",
                "https://example.test/category/two/",
                "https://example.test/category/three/",
                "https://example.test/tag/rust/",
            ]
        );
    }

    #[test]
    fn plan_deduplicates_preserving_order() {
        let plan = RegenerationPlan::from_urls(vec![
            "/b".to_string(),
            "/a/".to_string(),
            "/b/".to_string(),
        ]);
        assert_eq!(plan.urls(), ["/b/", "/a/"]);
        assert_eq!(plan.to_string(), "RegenerationPlan { urls: 2 }");
    }
}
