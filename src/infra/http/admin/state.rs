use std::sync::Arc;

use url::Url;

use crate::cache::{ArtifactStore, RegenerationTrigger};

#[derive(Clone)]
pub struct AdminState {
    pub trigger: Arc<RegenerationTrigger>,
    pub store: Arc<ArtifactStore>,
    /// Regeneration requests must resolve under this root.
    pub site_base: Url,
}
