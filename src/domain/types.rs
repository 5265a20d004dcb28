use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Private,
    Published,
    Trashed,
}

impl PostStatus {
    /// Only published posts are reachable by visitors.
    pub fn is_public(self) -> bool {
        matches!(self, PostStatus::Published)
    }
}
