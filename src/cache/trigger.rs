//! Regeneration trigger.
//!
//! Entry point for content changes: plans the affected URLs, drops their
//! stale artifacts and queues regeneration. Callers get the plan back as soon
//! as the work is queued.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::events::ChangeEvent;
use super::planner::{PlanError, RegenerationPlan, RegenerationPlanner};
use super::queue::RegenerationQueue;
use super::store::ArtifactStore;

pub struct RegenerationTrigger {
    planner: RegenerationPlanner,
    store: Arc<ArtifactStore>,
    queue: RegenerationQueue,
}

impl RegenerationTrigger {
    pub fn new(
        planner: RegenerationPlanner,
        store: Arc<ArtifactStore>,
        queue: RegenerationQueue,
    ) -> Self {
        Self {
            planner,
            store,
            queue,
        }
    }

    pub fn queue(&self) -> &RegenerationQueue {
        &self.queue
    }

    /// Plan, clear and queue. Does not wait for generation.
    #[instrument(skip_all, fields(event = event.kind()))]
    pub async fn on_change(&self, event: ChangeEvent) -> Result<RegenerationPlan, PlanError> {
        if self.store.is_pretend() {
            debug!(event = ?event, "Regeneration skipped: pretend mode");
            return Ok(RegenerationPlan::default());
        }

        let plan = self.planner.plan(&event).await?;

        if event.is_global() {
            if let Err(err) = self.store.clear(None) {
                warn!(
                    target = "abovefold::trigger",
                    error = %err,
                    "failed to clear artifact store"
                );
            }
        } else {
            for url in plan.urls() {
                if let Err(err) = self.store.clear_url(url) {
                    warn!(
                        target = "abovefold::trigger",
                        url = %url,
                        error = %err,
                        "failed to clear stale artifacts"
                    );
                }
            }
        }

        let queued = plan
            .urls()
            .iter()
            .filter(|url| self.queue.submit(url))
            .count();

        info!(
            target = "abovefold::trigger",
            event = event.kind(),
            urls = plan.urls().len(),
            queued = queued,
            "regeneration planned"
        );
        Ok(plan)
    }

    pub async fn post_changed(&self, post_id: u64) -> Result<RegenerationPlan, PlanError> {
        self.on_change(ChangeEvent::PostChanged { post_id }).await
    }

    pub async fn comment_changed(&self, comment_id: u64) -> Result<RegenerationPlan, PlanError> {
        self.on_change(ChangeEvent::CommentChanged { comment_id }).await
    }

    pub async fn terms_changed(
        &self,
        taxonomy: &str,
        ids: Vec<u64>,
        affects_all: bool,
    ) -> Result<RegenerationPlan, PlanError> {
        self.on_change(ChangeEvent::TermsChanged {
            ids,
            taxonomy: taxonomy.to_string(),
            affects_all,
        })
        .await
    }

    pub async fn global_invalidation(&self) -> Result<RegenerationPlan, PlanError> {
        self.on_change(ChangeEvent::GlobalInvalidation).await
    }
}
