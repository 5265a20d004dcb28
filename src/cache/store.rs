//! Artifact store.
//!
//! One file per `CacheKey` under a single root directory. Writes go through a
//! temporary file in the same directory and are renamed into place, so readers
//! see either the previous artifact or the new one, never a partial file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use super::keys::{CacheKey, ViewportClass};

const SOURCE: &str = "cache::store";
const METRIC_ARTIFACT_READ: &str = "abovefold_artifact_read_total";
const METRIC_ARTIFACT_WRITE: &str = "abovefold_artifact_write_total";
const ARTIFACT_EXTENSION: &str = "css";
const TEMP_PREFIX: &str = ".artifact-";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage root `{path}` is unavailable: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write critical-path CSS for [{key}] to `{path}`: {source}")]
    Write {
        key: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove `{path}`: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of looking an artifact up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Stored CSS for the key.
    Stored(String),
    /// Diagnostic comment served when nothing usable is stored.
    Placeholder(String),
}

impl Artifact {
    pub fn is_stored(&self) -> bool {
        matches!(self, Artifact::Stored(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Artifact::Stored(text) | Artifact::Placeholder(text) => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Artifact::Stored(text) | Artifact::Placeholder(text) => text,
        }
    }
}

#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    viewports: Vec<ViewportClass>,
    pretend: bool,
}

impl ArtifactStore {
    /// `viewports` is the set `has_all` and `clear_url` operate on.
    pub fn new(
        root: impl Into<PathBuf>,
        viewports: impl IntoIterator<Item = ViewportClass>,
        pretend: bool,
    ) -> Self {
        Self {
            root: root.into(),
            viewports: viewports.into_iter().collect(),
            pretend,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn viewports(&self) -> &[ViewportClass] {
        &self.viewports
    }

    pub fn is_pretend(&self) -> bool {
        self.pretend
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.storage_name())
    }

    pub fn ensure_root_exists(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::StorageUnavailable {
            path: self.root.clone(),
            source,
        })?;

        let metadata = fs::metadata(&self.root).map_err(|source| StoreError::StorageUnavailable {
            path: self.root.clone(),
            source,
        })?;
        if metadata.permissions().readonly() {
            return Err(StoreError::StorageUnavailable {
                path: self.root.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "directory is read-only"),
            });
        }
        Ok(())
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.path_for(key).is_file()
    }

    /// True when every configured viewport has an artifact for `url`.
    pub fn has_all(&self, url: &str) -> bool {
        !self.viewports.is_empty()
            && self
                .viewports
                .iter()
                .all(|viewport| self.has(&CacheKey::new(viewport.clone(), url)))
    }

    /// Look the artifact up without ever failing.
    ///
    /// Pretend mode always yields an empty placeholder.
    pub fn lookup(&self, key: &CacheKey) -> Artifact {
        if self.pretend {
            return Artifact::Placeholder(String::new());
        }
        let path = self.path_for(key);
        let result = fs::read_to_string(&path);
        self.artifact_from(key, &path, result)
    }

    /// `lookup` for async callers; the file is read through `tokio::fs`.
    pub async fn load(&self, key: &CacheKey) -> Artifact {
        if self.pretend {
            return Artifact::Placeholder(String::new());
        }
        let path = self.path_for(key);
        let result = tokio::fs::read_to_string(&path).await;
        self.artifact_from(key, &path, result)
    }

    fn artifact_from(
        &self,
        key: &CacheKey,
        path: &Path,
        result: io::Result<String>,
    ) -> Artifact {
        match result {
            Ok(css) => {
                counter!(METRIC_ARTIFACT_READ, "outcome" => "hit").increment(1);
                Artifact::Stored(css)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                counter!(METRIC_ARTIFACT_READ, "outcome" => "miss").increment(1);
                debug!(target = SOURCE, key = %key, "critical-path CSS not found");
                Artifact::Placeholder(placeholder(key, path))
            }
            Err(err) => {
                counter!(METRIC_ARTIFACT_READ, "outcome" => "error").increment(1);
                warn!(
                    target = SOURCE,
                    key = %key,
                    path = %path.display(),
                    error = %err,
                    "failed to read critical-path CSS"
                );
                Artifact::Placeholder(placeholder(key, path))
            }
        }
    }

    /// Stored CSS, or the placeholder comment when the artifact is unavailable.
    pub fn read(&self, key: &CacheKey) -> String {
        self.lookup(key).into_text()
    }

    /// `read` wrapped in an inline style element. Empty in pretend mode.
    pub fn css(&self, key: &CacheKey) -> String {
        if self.pretend {
            return String::new();
        }
        style_block(&self.read(key))
    }

    /// Atomically replace the artifact for `key`. Returns the final path.
    pub fn write(&self, key: &CacheKey, css: &str) -> Result<PathBuf, StoreError> {
        let path = self.path_for(key);
        let write_error = |source: io::Error| StoreError::Write {
            key: key.to_string(),
            path: path.clone(),
            source,
        };

        let result = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".tmp")
            .tempfile_in(&self.root)
            .map_err(write_error)
            .and_then(|mut temp| {
                temp.write_all(css.as_bytes()).map_err(write_error)?;
                temp.as_file().sync_all().map_err(write_error)?;
                temp.persist(&path).map_err(|err| write_error(err.error))?;
                Ok(())
            });

        match result {
            Ok(()) => {
                counter!(METRIC_ARTIFACT_WRITE, "result" => "ok").increment(1);
                debug!(target = SOURCE, key = %key, path = %path.display(), "artifact written");
                Ok(path)
            }
            Err(err) => {
                counter!(METRIC_ARTIFACT_WRITE, "result" => "error").increment(1);
                Err(err)
            }
        }
    }

    /// Remove one artifact, or every artifact when `key` is `None`.
    ///
    /// Missing files and a missing root are not errors.
    pub fn clear(&self, key: Option<&CacheKey>) -> Result<(), StoreError> {
        match key {
            Some(key) => remove_if_present(&self.path_for(key)),
            None => self.clear_all(),
        }
    }

    /// Remove the artifacts of every configured viewport for `url`.
    pub fn clear_url(&self, url: &str) -> Result<(), StoreError> {
        for viewport in &self.viewports {
            self.clear(Some(&CacheKey::new(viewport.clone(), url)))?;
        }
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StoreError::StorageUnavailable {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| StoreError::StorageUnavailable {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            // In-flight temp files belong to concurrent writers.
            let is_artifact = path.is_file()
                && path
                    .extension()
                    .is_some_and(|extension| extension == ARTIFACT_EXTENSION);
            if is_artifact {
                remove_if_present(&path)?;
            }
        }
        Ok(())
    }
}

/// Wrap CSS in the inline style element placed in the document head.
///
/// Any `</style` sequence, in any letter case, is escaped so the CSS cannot
/// close the element early.
pub fn style_block(css: &str) -> String {
    let mut escaped = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(index) = rest.find("</") {
        let (head, tail) = rest.split_at(index);
        escaped.push_str(head);
        let closes_style = tail
            .get(2..7)
            .is_some_and(|name| name.eq_ignore_ascii_case("style"));
        escaped.push_str(if closes_style { "<\\/" } else { "</" });
        rest = &tail[2..];
    }
    escaped.push_str(rest);
    format!("<style data-inlined>{escaped}</style>")
}

/// Diagnostic CSS comment for a missing artifact.
pub fn placeholder(key: &CacheKey, path: &Path) -> String {
    let text = format!(
        "Critical-path CSS for [{key}] not found at [{}]. Run `abovefold generate --uri={}` to generate it.",
        path.display(),
        key.url()
    );
    format!("/* {} */", text.replace("*/", "* /"))
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Clear {
            path: path.to_path_buf(),
            source,
        }),
    }
}
