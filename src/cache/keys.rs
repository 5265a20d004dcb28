//! Cache key definitions.
//!
//! A `CacheKey` pairs a viewport class with a normalized page URL. Its display
//! form (`{viewport}:{url}`) is hashed into the artifact file name, so two keys
//! that render identically always share one artifact.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Name of a viewport bucket (`mobile`, `tablet`, `desktop`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct ViewportClass(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid viewport name `{0}`: use lowercase letters, digits, `-` or `_`")]
pub struct InvalidViewportName(pub String);

impl ViewportClass {
    pub const MOBILE: &'static str = "mobile";
    pub const TABLET: &'static str = "tablet";
    pub const DESKTOP: &'static str = "desktop";

    pub fn new(name: &str) -> Result<Self, InvalidViewportName> {
        let normalized = name.trim().to_ascii_lowercase();
        let valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if valid {
            Ok(Self(normalized))
        } else {
            Err(InvalidViewportName(name.to_string()))
        }
    }

    pub fn mobile() -> Self {
        Self(Self::MOBILE.to_string())
    }

    pub fn tablet() -> Self {
        Self(Self::TABLET.to_string())
    }

    pub fn desktop() -> Self {
        Self(Self::DESKTOP.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewportClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ViewportClass {
    type Err = InvalidViewportName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ViewportClass {
    type Error = InvalidViewportName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

/// Identifies one critical-path CSS artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    viewport: ViewportClass,
    url: String,
}

impl CacheKey {
    /// Build a key, normalizing `url` with [`normalize_url`].
    pub fn new(viewport: ViewportClass, url: &str) -> Self {
        Self {
            viewport,
            url: normalize_url(url),
        }
    }

    pub fn viewport(&self) -> &ViewportClass {
        &self.viewport
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// File name of the artifact inside the storage root.
    pub fn storage_name(&self) -> String {
        format!("{}.css", hash_key(&self.to_string()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.viewport, self.url)
    }
}

/// Canonical form of a page URL.
///
/// Surrounding whitespace and the fragment are dropped and the path always ends
/// with `/`. The query string is kept. Relative paths (`/about`) are accepted
/// and normalized the same way.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();

    if let Ok(mut url) = Url::parse(trimmed) {
        url.set_fragment(None);
        if !url.cannot_be_a_base() && !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        return url.to_string();
    }

    let without_fragment = trimmed.split('#').next().unwrap_or_default();
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };

    let mut normalized = path.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    if let Some(query) = query {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized
}

/// Resolves `raw` against `base` and returns its canonical form when it stays
/// under the site root.
///
/// Relative paths join onto `base`. Other hosts, schemes and paths outside the
/// base path yield `None`.
pub fn site_url(base: &Url, raw: &str) -> Option<String> {
    let joined = base.join(raw.trim()).ok()?;
    let candidate = normalize_url(joined.as_str());
    candidate
        .starts_with(&normalize_url(base.as_str()))
        .then_some(candidate)
}

/// Lowercase hex SHA-256 of `value`.
pub fn hash_key(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_names_are_lowercased() {
        let class = ViewportClass::new(" Mobile ").expect("valid name");
        assert_eq!(class, ViewportClass::mobile());
    }

    #[test]
    fn viewport_names_reject_separators() {
        assert!(ViewportClass::new("mobile:wide").is_err());
        assert!(ViewportClass::new("").is_err());
        assert!(ViewportClass::new("../etc").is_err());
    }

    #[test]
    fn normalize_adds_trailing_slash() {
        assert_eq!(
            normalize_url("https://example.test/about"),
            "https://example.test/about/"
        );
        assert_eq!(normalize_url("/about"), "/about/");
        assert_eq!(normalize_url(""), "/");
    }

    #[test]
    fn normalize_keeps_query_and_drops_fragment() {
        assert_eq!(
            normalize_url("  https://example.test/search?q=rust#results "),
            "https://example.test/search/?q=rust"
        );
        assert_eq!(normalize_url("/search?q=rust#top"), "/search/?q=rust");
    }

    #[test]
    fn site_url_resolves_relative_paths() {
        let base = Url::parse("https://example.test/").expect("base url");
        assert_eq!(
            site_url(&base, "/blog").as_deref(),
            Some("https://example.test/blog/")
        );
        assert_eq!(
            site_url(&base, " https://example.test/a?b=1#c ").as_deref(),
            Some("https://example.test/a/?b=1")
        );
    }

    #[test]
    fn site_url_rejects_other_origins() {
        let base = Url::parse("https://example.test/").expect("base url");
        for raw in [
            "https://evil.test/x",
            "//evil.test/x",
            "http://example.test/x",
            "https://example.test.evil.test/",
            "https://example.test:8443/x",
        ] {
            assert_eq!(site_url(&base, raw), None, "{raw} should be rejected");
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_url("https://example.test/a/b");
        assert_eq!(normalize_url(&once), once);
    }

    #[test]
    fn equivalent_urls_share_storage_name() {
        let a = CacheKey::new(ViewportClass::mobile(), "https://example.test/a");
        let b = CacheKey::new(ViewportClass::mobile(), "https://example.test/a/#comments");
        assert_eq!(a, b);
        assert_eq!(a.storage_name(), b.storage_name());
    }

    #[test]
    fn viewports_produce_distinct_names() {
        let mobile = CacheKey::new(ViewportClass::mobile(), "/a/");
        let desktop = CacheKey::new(ViewportClass::desktop(), "/a/");
        assert_ne!(mobile.storage_name(), desktop.storage_name());
    }

    #[test]
    fn display_joins_viewport_and_url() {
        let key = CacheKey::new(ViewportClass::tablet(), "/a");
        assert_eq!(key.to_string(), "tablet:/a/");
        assert!(key.storage_name().ends_with(".css"));
        assert_eq!(key.storage_name().len(), 64 + 4);
    }
}
