//! Check scheduler: picks eligible catalog rows, runs probes through the
//! worker pool, and dates the next check.
//!
//! Batch size follows free prober capacity. A claimed row is marked
//! `CRAWLING` inside the claim transaction, so two passes can never probe
//! the same resource concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::ScheduleSettings;
use crate::crawl::prober::{is_success, Prober};
use crate::models::{Check, Resource, ResourceStatus};
use crate::queue::{JobKind, Priority, WorkQueue};
use crate::repository::{CatalogRepository, RepositoryError};
use crate::webhook;

/// What a finished probe/analysis round tells the scheduler.
#[derive(Debug, Clone, Copy)]
pub enum ScheduleVerdict {
    /// Content changed; `reliable` marks a dated modification (anything
    /// better than a bare content-length flip).
    Changed {
        last_modified_at: Option<DateTime<Utc>>,
        reliable: bool,
    },
    /// Confirmed unchanged.
    Unchanged,
    /// The cascade could not decide.
    Inconclusive,
    /// Transport failure or 5xx.
    Failed,
}

/// Resulting scheduling decision.
#[derive(Debug, Clone, Copy)]
pub struct SchedulePlan {
    pub next_check_at: DateTime<Utc>,
    pub unchanged_streak: u32,
    pub failure_streak: u32,
}

/// Adaptive next-check dating, pure of storage.
#[derive(Debug, Clone)]
pub struct NextCheckPolicy {
    settings: ScheduleSettings,
}

impl NextCheckPolicy {
    pub fn new(settings: ScheduleSettings) -> Self {
        Self { settings }
    }

    /// Compute the next check date from the verdict and the resource's
    /// current streaks.
    pub fn plan(
        &self,
        now: DateTime<Utc>,
        verdict: ScheduleVerdict,
        unchanged_streak: u32,
        failure_streak: u32,
    ) -> SchedulePlan {
        let cfg = &self.settings;
        match verdict {
            ScheduleVerdict::Changed {
                last_modified_at,
                reliable,
            } => {
                let interval = match last_modified_at {
                    // older content is rechecked less often
                    Some(modified_at) if reliable => {
                        let age = (now - modified_at).num_seconds().max(0) as u64;
                        age / 2
                    }
                    _ => cfg.base_interval_secs,
                };
                SchedulePlan {
                    next_check_at: now + self.clamped(interval),
                    unchanged_streak: 0,
                    failure_streak: 0,
                }
            }
            ScheduleVerdict::Unchanged => {
                let exponent = unchanged_streak.min(16);
                let interval = cfg
                    .base_interval_secs
                    .saturating_mul(1u64 << exponent)
                    .min(cfg.max_interval_secs);
                SchedulePlan {
                    next_check_at: now + self.clamped(interval),
                    unchanged_streak: unchanged_streak + 1,
                    failure_streak: 0,
                }
            }
            ScheduleVerdict::Inconclusive => SchedulePlan {
                next_check_at: now + self.clamped(cfg.base_interval_secs),
                unchanged_streak: 0,
                failure_streak: 0,
            },
            ScheduleVerdict::Failed => {
                let failures = failure_streak + 1;
                let interval = if failures <= cfg.max_failure_retries {
                    cfg.failure_retry_secs
                } else {
                    cfg.base_interval_secs
                };
                SchedulePlan {
                    next_check_at: now + self.clamped(interval),
                    unchanged_streak: 0,
                    failure_streak: failures,
                }
            }
        }
    }

    fn clamped(&self, interval_secs: u64) -> chrono::Duration {
        let clamped = interval_secs
            .max(self.settings.min_interval_secs)
            .min(self.settings.max_interval_secs);
        chrono::Duration::seconds(clamped as i64)
    }
}

/// Shared probe path used by the scheduler loop and the on-demand API.
pub struct Crawler {
    pub catalog: Arc<CatalogRepository>,
    pub prober: Arc<Prober>,
    pub queue: Arc<WorkQueue>,
    pub policy: Arc<NextCheckPolicy>,
}

impl Crawler {
    /// Probe an already-claimed resource and route the outcome: the check
    /// document goes upstream for every outcome, successful probes also go
    /// to the analysis queue, failed ones are rescheduled on the retry
    /// lane.
    pub async fn probe_resource(
        &self,
        resource: &Resource,
        force_analysis: bool,
    ) -> Result<Check, RepositoryError> {
        let check = self.prober.probe(resource).await?;

        self.queue.push(
            JobKind::SendWebhook {
                dataset_id: resource.dataset_id.clone(),
                resource_id: resource.resource_id,
                document: webhook::build_check_document(&check, None),
            },
            Priority::High,
        );

        if is_success(&check) {
            self.catalog
                .set_status(resource.resource_id, Some(ResourceStatus::ToAnalyseResource))?;
            self.queue.push(
                JobKind::AnalyseResource {
                    check_id: check.id,
                    force: force_analysis,
                },
                Priority::Default,
            );
        } else {
            let plan = self.policy.plan(
                Utc::now(),
                ScheduleVerdict::Failed,
                resource.unchanged_streak,
                resource.failure_streak,
            );
            self.catalog.schedule_next(
                resource.resource_id,
                plan.next_check_at,
                plan.unchanged_streak,
                plan.failure_streak,
            )?;
            self.catalog.set_status(resource.resource_id, None)?;
        }

        Ok(check)
    }
}

/// The crawl loop.
pub struct Scheduler {
    crawler: Arc<Crawler>,
    pool_size: usize,
    idle_sleep: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        crawler: Arc<Crawler>,
        pool_size: usize,
        idle_sleep: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            crawler,
            pool_size,
            idle_sleep,
            shutdown,
        }
    }

    /// Run until shutdown. Claims batches sized to free prober capacity
    /// and fans them out to worker tasks.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let permits = Arc::new(Semaphore::new(self.pool_size));
        info!("Scheduler started with pool size {}", self.pool_size);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let capacity = permits.available_permits();
            if capacity == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            let batch = match self.crawler.catalog.claim_batch(capacity, Utc::now()) {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Batch selection failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                let idle = self.idle_sleep;
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    changed = self.shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            debug!("Claimed {} resources for probing", batch.len());
            for resource in batch {
                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .unwrap_or_else(|_| unreachable!("pool semaphore closed"));
                let crawler = self.crawler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = crawler.probe_resource(&resource, false).await {
                        warn!("Probe of {} failed to record: {}", resource.url, e);
                    }
                });
            }
        }

        // abandoned claims revert so the next start re-selects them
        let released = self.crawler.catalog.release_crawling()?;
        if released > 0 {
            info!("Released {} in-flight claims on shutdown", released);
        }
        Ok(())
    }
}
