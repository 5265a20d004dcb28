//! Critical CSS configuration.
//!
//! Holds the viewport table consumed by generation and the gate settings used
//! on the serving path.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::keys::ViewportClass;

// Default values for gate configuration
pub const DEFAULT_COOKIE_NAME: &str = "abovefold-css";
pub const DEFAULT_CONTENT_VERSION: &str = "1.0.0";
pub const DEFAULT_MARKER_TTL_SECS: u64 = 28 * 24 * 60 * 60;
pub const DEFAULT_AUTOMATION_USER_AGENTS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "headlesschrome",
    "lighthouse",
    "curl",
    "wget",
];

const REQUIRED_VIEWPORTS: [&str; 3] = [
    ViewportClass::MOBILE,
    ViewportClass::TABLET,
    ViewportClass::DESKTOP,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("viewport `{0}` must be configured")]
    MissingViewport(String),
    #[error("viewport `{name}` requires a positive `{dimension}`")]
    Dimension {
        name: String,
        dimension: &'static str,
    },
    #[error("invalid viewport name `{0}`")]
    InvalidName(String),
    #[error("viewport table {table:?} does not match classifier classes {classifier:?}")]
    Mismatch {
        table: Vec<String>,
        classifier: Vec<String>,
    },
}

/// Viewport entry as it appears in configuration files.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct RawViewport {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportSpec {
    pub name: ViewportClass,
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl ViewportSpec {
    fn new(name: ViewportClass, width: u32, height: u32) -> Option<Self> {
        Some(Self {
            name,
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }
}

/// Named viewport dimensions, keyed by class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportTable {
    specs: BTreeMap<ViewportClass, ViewportSpec>,
}

impl Default for ViewportTable {
    fn default() -> Self {
        let specs = [
            (ViewportClass::mobile(), 614, 736),
            (ViewportClass::tablet(), 768, 1024),
            (ViewportClass::desktop(), 1024, 1366),
        ]
        .into_iter()
        .filter_map(|(name, width, height)| ViewportSpec::new(name, width, height))
        .map(|spec| (spec.name.clone(), spec))
        .collect();
        Self { specs }
    }
}

impl ViewportTable {
    /// Build a table from raw entries. An empty map yields the default table.
    pub fn from_raw(raw: &BTreeMap<String, RawViewport>) -> Result<Self, ConfigValidationError> {
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let mut specs = BTreeMap::new();
        for (name, dimensions) in raw {
            let class = ViewportClass::new(name)
                .map_err(|_| ConfigValidationError::InvalidName(name.clone()))?;
            let width = dimensions.width.filter(|value| *value > 0).ok_or_else(|| {
                ConfigValidationError::Dimension {
                    name: class.to_string(),
                    dimension: "width",
                }
            })?;
            let height = dimensions.height.filter(|value| *value > 0).ok_or_else(|| {
                ConfigValidationError::Dimension {
                    name: class.to_string(),
                    dimension: "height",
                }
            })?;
            if let Some(spec) = ViewportSpec::new(class.clone(), width, height) {
                specs.insert(class, spec);
            }
        }

        let table = Self { specs };
        table.require_defaults()?;
        Ok(table)
    }

    pub fn get(&self, class: &ViewportClass) -> Option<&ViewportSpec> {
        self.specs.get(class)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewportSpec> {
        self.specs.values()
    }

    pub fn classes(&self) -> Vec<ViewportClass> {
        self.specs.keys().cloned().collect()
    }

    /// Ensure every class the classifier can produce has dimensions, and that
    /// the table names no class the classifier never produces.
    pub fn validate(
        &self,
        produced: &BTreeSet<ViewportClass>,
    ) -> Result<(), ConfigValidationError> {
        self.require_defaults()?;

        let configured: BTreeSet<&ViewportClass> = self.specs.keys().collect();
        let expected: BTreeSet<&ViewportClass> = produced.iter().collect();
        if configured != expected {
            return Err(ConfigValidationError::Mismatch {
                table: self.specs.keys().map(ToString::to_string).collect(),
                classifier: produced.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(())
    }

    fn require_defaults(&self) -> Result<(), ConfigValidationError> {
        for name in REQUIRED_VIEWPORTS {
            let present = self.specs.keys().any(|class| class.as_str() == name);
            if !present {
                return Err(ConfigValidationError::MissingViewport(name.to_string()));
            }
        }
        Ok(())
    }
}

/// Settings for the cache gate and the client version marker.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Cookie carrying the content version a client has already cached.
    pub cookie_name: String,
    /// Lifetime of the marker cookie.
    pub marker_ttl: Duration,
    /// Version of the site stylesheets; bump it to re-inline for everyone.
    pub content_version: String,
    /// Lowercase user-agent fragments that identify automated clients.
    pub automation_user_agents: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            marker_ttl: Duration::from_secs(DEFAULT_MARKER_TTL_SECS),
            content_version: DEFAULT_CONTENT_VERSION.to_string(),
            automation_user_agents: DEFAULT_AUTOMATION_USER_AGENTS
                .iter()
                .map(|token| token.to_string())
                .collect(),
        }
    }
}

impl From<&crate::config::GateSettings> for GateConfig {
    fn from(settings: &crate::config::GateSettings) -> Self {
        Self {
            cookie_name: settings.cookie_name.clone(),
            marker_ttl: settings.marker_ttl,
            content_version: settings.content_version.clone(),
            automation_user_agents: settings
                .automation_user_agents
                .iter()
                .map(|token| token.to_ascii_lowercase())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(entries: &[(&str, Option<u32>, Option<u32>)]) -> BTreeMap<String, RawViewport> {
        entries
            .iter()
            .map(|(name, width, height)| {
                (
                    name.to_string(),
                    RawViewport {
                        width: *width,
                        height: *height,
                    },
                )
            })
            .collect()
    }

    fn standard_classes() -> BTreeSet<ViewportClass> {
        [
            ViewportClass::mobile(),
            ViewportClass::tablet(),
            ViewportClass::desktop(),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn default_values() {
        let table = ViewportTable::default();
        let mobile = table.get(&ViewportClass::mobile()).expect("mobile");
        assert_eq!((mobile.width.get(), mobile.height.get()), (614, 736));
        let tablet = table.get(&ViewportClass::tablet()).expect("tablet");
        assert_eq!((tablet.width.get(), tablet.height.get()), (768, 1024));
        let desktop = table.get(&ViewportClass::desktop()).expect("desktop");
        assert_eq!((desktop.width.get(), desktop.height.get()), (1024, 1366));

        let gate = GateConfig::default();
        assert_eq!(gate.cookie_name, "abovefold-css");
        assert_eq!(gate.marker_ttl, Duration::from_secs(2_419_200));
    }

    #[test]
    fn empty_raw_table_uses_defaults() {
        let table = ViewportTable::from_raw(&BTreeMap::new()).expect("defaults");
        assert_eq!(table, ViewportTable::default());
    }

    #[test]
    fn missing_height_is_rejected() {
        let err = ViewportTable::from_raw(&raw(&[
            ("mobile", Some(400), None),
            ("tablet", Some(768), Some(1024)),
            ("desktop", Some(1024), Some(1366)),
        ]))
        .expect_err("height missing");
        assert_eq!(
            err,
            ConfigValidationError::Dimension {
                name: "mobile".to_string(),
                dimension: "height",
            }
        );
    }

    #[test]
    fn missing_required_viewport_is_rejected() {
        let err = ViewportTable::from_raw(&raw(&[
            ("mobile", Some(400), Some(700)),
            ("desktop", Some(1024), Some(1366)),
        ]))
        .expect_err("tablet missing");
        assert_eq!(
            err,
            ConfigValidationError::MissingViewport("tablet".to_string())
        );
    }

    #[test]
    fn validate_accepts_matching_classes() {
        ViewportTable::default()
            .validate(&standard_classes())
            .expect("matching table");
    }

    #[test]
    fn validate_rejects_unknown_extra_class() {
        let table = ViewportTable::from_raw(&raw(&[
            ("mobile", Some(400), Some(700)),
            ("tablet", Some(768), Some(1024)),
            ("desktop", Some(1024), Some(1366)),
            ("watch", Some(200), Some(200)),
        ]))
        .expect("structurally valid");

        let err = table
            .validate(&standard_classes())
            .expect_err("watch is never produced");
        assert!(matches!(err, ConfigValidationError::Mismatch { .. }));
    }
}
