//! Background regeneration queue.
//!
//! Jobs are drained by a single worker task that fans out to at most
//! `concurrency` generations at a time. A URL that is already waiting in the
//! queue is not queued twice; once its job starts, a new change may queue it
//! again.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tokio::sync::{Semaphore, mpsc, mpsc::error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::generator::CriticalCssGenerator;

use super::keys::normalize_url;

const METRIC_REGENERATION_JOBS: &str = "abovefold_regeneration_jobs_total";
const METRIC_QUEUE_PENDING: &str = "abovefold_regeneration_pending";
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RegenerationJob {
    pub id: Uuid,
    pub url: String,
    pub enqueued_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct RegenerationQueue {
    sender: mpsc::Sender<RegenerationJob>,
    queued: Arc<DashMap<String, Uuid>>,
    pending: Arc<AtomicUsize>,
}

impl RegenerationQueue {
    /// Start the worker. The returned handle finishes once every queue clone
    /// has been dropped and the backlog is drained.
    pub fn spawn(
        generator: Arc<CriticalCssGenerator>,
        concurrency: usize,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queued = Arc::new(DashMap::new());
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            generator,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            queued: Arc::clone(&queued),
            pending: Arc::clone(&pending),
        };
        let handle = tokio::spawn(worker.run(receiver));

        (
            Self {
                sender,
                queued,
                pending,
            },
            handle,
        )
    }

    /// Queue `url` for regeneration without waiting for it to run.
    ///
    /// Returns false when the URL is already waiting or the worker is gone.
    pub fn submit(&self, url: &str) -> bool {
        let url = normalize_url(url);
        let id = Uuid::new_v4();

        match self.queued.entry(url.clone()) {
            Entry::Occupied(existing) => {
                debug!(
                    target = "abovefold::queue",
                    url = %url,
                    job_id = %existing.get(),
                    "regeneration already queued"
                );
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        record_pending(self.pending.fetch_add(1, Ordering::SeqCst) + 1);
        let job = RegenerationJob {
            id,
            url,
            enqueued_at: OffsetDateTime::now_utc(),
        };

        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                let queue = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = queue.sender.send(job).await {
                        queue.abandon(&err.0);
                    }
                });
                true
            }
            Err(TrySendError::Closed(job)) => {
                self.abandon(&job);
                false
            }
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolve once no job is queued or running.
    pub async fn wait_idle(&self) {
        while self.pending() > 0 {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    fn abandon(&self, job: &RegenerationJob) {
        self.queued.remove_if(&job.url, |_, id| *id == job.id);
        record_pending(self.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1));
        counter!(METRIC_REGENERATION_JOBS, "result" => "dropped").increment(1);
        warn!(
            target = "abovefold::queue",
            job_id = %job.id,
            url = %job.url,
            "regeneration queue closed; job dropped"
        );
    }
}

struct Worker {
    generator: Arc<CriticalCssGenerator>,
    semaphore: Arc<Semaphore>,
    queued: Arc<DashMap<String, Uuid>>,
    pending: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<RegenerationJob>) {
        while let Some(job) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                break;
            };

            self.queued.remove_if(&job.url, |_, id| *id == job.id);

            let generator = Arc::clone(&self.generator);
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                let _permit = permit;
                run_job(&generator, &job).await;
                record_pending(pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1));
            });
        }
        debug!(target = "abovefold::queue", "regeneration worker stopped");
    }
}

fn record_pending(value: usize) {
    gauge!(METRIC_QUEUE_PENDING).set(value as f64);
}

async fn run_job(generator: &CriticalCssGenerator, job: &RegenerationJob) {
    let waited_ms = (OffsetDateTime::now_utc() - job.enqueued_at).whole_milliseconds();

    match generator.generate_all(&job.url).await {
        Ok(outcomes) => {
            let mut failed = 0usize;
            for outcome in &outcomes {
                if let Err(err) = &outcome.result {
                    failed += 1;
                    warn!(
                        target = "abovefold::queue",
                        job_id = %job.id,
                        url = %job.url,
                        viewport = %outcome.viewport,
                        reason = err.label(),
                        error = %err,
                        "viewport regeneration failed"
                    );
                }
            }
            let result = if failed == 0 { "ok" } else { "partial" };
            counter!(METRIC_REGENERATION_JOBS, "result" => result).increment(1);
            info!(
                target = "abovefold::queue",
                job_id = %job.id,
                url = %job.url,
                viewports = outcomes.len(),
                failed = failed,
                waited_ms = waited_ms,
                "regeneration finished"
            );
        }
        Err(err) => {
            counter!(METRIC_REGENERATION_JOBS, "result" => "failed").increment(1);
            warn!(
                target = "abovefold::queue",
                job_id = %job.id,
                url = %job.url,
                reason = err.label(),
                error = %err,
                "regeneration failed"
            );
        }
    }
}
