//! Content change events.
//!
//! These arrive from the content system (admin webhook or CLI) and are turned
//! into URL sets by the regeneration planner.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A post was created, updated or changed status.
    PostChanged { post_id: u64 },
    /// Terms of a taxonomy changed.
    ///
    /// With `affects_all` set, every term of the taxonomy is regenerated and
    /// `ids` is ignored.
    TermsChanged {
        #[serde(default)]
        ids: Vec<u64>,
        taxonomy: String,
        #[serde(default)]
        affects_all: bool,
    },
    /// A comment was added, edited or moderated.
    CommentChanged { comment_id: u64 },
    /// Something site-wide changed (theme, widgets, menus, customizer).
    GlobalInvalidation,
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::PostChanged { .. } => "post_changed",
            ChangeEvent::TermsChanged { .. } => "terms_changed",
            ChangeEvent::CommentChanged { .. } => "comment_changed",
            ChangeEvent::GlobalInvalidation => "global_invalidation",
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, ChangeEvent::GlobalInvalidation)
    }
}
